use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Shared value guarded by a mutex plus a condvar so that waiters are woken on every change.
///
/// The supervisor uses `Context<bool>` as its cancellation flag: `true` means a shutdown was
/// requested. The same type is used for the "child exited" notification the terminator waits on.
#[derive(Debug, Clone, Default)]
pub struct Context<T>(Arc<(Mutex<T>, Condvar)>);

impl<T> Context<T>
where
    T: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value and notifies every thread waiting on this [`Context`].
    pub fn cancel_all(&self, val: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        let (lck, cvar) = &*self.0;
        let mut lck = lck.lock()?;
        *lck = val;
        cvar.notify_all();
        Ok(())
    }

    /// Resets the Mutex to the default T value
    pub fn reset(&self) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        let (lck, _) = &*self.0;
        let mut lck = lck.lock()?;
        *lck = T::default();
        Ok(())
    }
}

impl Context<bool> {
    /// Returns the current flag. A poisoned lock still holds a meaningful flag, so it is read anyway.
    pub fn is_cancelled(&self) -> bool {
        let (lck, _) = &*self.0;
        *lck.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the flag becomes `true` or `timeout` elapses.
    /// Returns `true` when the flag was set, `false` on timeout.
    pub fn wait_cancelled_timeout(&self, timeout: Duration) -> bool {
        let (lck, cvar) = &*self.0;
        let guard = lck.lock().unwrap_or_else(PoisonError::into_inner);
        match cvar.wait_timeout_while(guard, timeout, |cancelled| !*cancelled) {
            Ok((cancelled, _)) => *cancelled,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }

    /// Blocks until the flag becomes `true`.
    pub fn wait_cancelled(&self) {
        let (lck, cvar) = &*self.0;
        let guard = lck.lock().unwrap_or_else(PoisonError::into_inner);
        drop(
            cvar.wait_while(guard, |cancelled| !*cancelled)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }
}
