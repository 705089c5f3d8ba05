use super::error::CommandError;
use crate::context::Context;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Time a supervised child gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[cfg(target_family = "unix")]
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How the child went away after [`ProcessTerminator::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Killed,
}

/// ProcessTerminator shuts down the process group led by `pid`: SIGTERM first and, when the
/// group has not gone away within the grace period, SIGKILL.
///
/// Children are spawned as process group leaders, so signalling the group also reaches whatever
/// a launcher script started.
pub struct ProcessTerminator {
    pid: u32,
    grace_period: Duration,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(self, grace_period: Duration) -> Self {
        Self {
            grace_period,
            ..self
        }
    }

    /// Sends SIGTERM and then runs `exited_on_time` with the grace period. It must block until
    /// the group leader exits (returning `true`) or the time runs out (returning `false`).
    /// Members that outlive the leader get the rest of the grace period before being killed.
    #[cfg(target_family = "unix")]
    pub fn shutdown<F>(self, exited_on_time: F) -> Result<Termination, CommandError>
    where
        F: FnOnce(Duration) -> bool,
    {
        use nix::sys::signal::Signal;

        let deadline = Instant::now() + self.grace_period;
        if !self.signal_group(Some(Signal::SIGTERM))? {
            return Ok(Termination::Graceful);
        }
        if exited_on_time(self.grace_period) && self.group_gone_before(deadline)? {
            return Ok(Termination::Graceful);
        }

        warn!(
            pid = self.pid,
            "Process didn't stop gracefully, force killing..."
        );
        self.signal_group(Some(Signal::SIGKILL))?;
        Ok(Termination::Killed)
    }

    #[cfg(target_family = "unix")]
    fn group_gone_before(&self, deadline: Instant) -> Result<bool, CommandError> {
        loop {
            if !self.signal_group(None)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(GROUP_POLL_INTERVAL);
        }
    }

    /// Returns `false` when the group no longer exists. `None` only probes for it.
    #[cfg(target_family = "unix")]
    fn signal_group(&self, signal: Option<nix::sys::signal::Signal>) -> Result<bool, CommandError> {
        use nix::{errno::Errno, sys::signal, unistd::Pid};

        if signal.is_some() {
            debug!(pid = self.pid, ?signal, "signalling process group");
        }
        match signal::killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[cfg(not(target_family = "unix"))]
    pub fn shutdown<F>(self, _exited_on_time: F) -> Result<Termination, CommandError>
    where
        F: FnOnce(Duration) -> bool,
    {
        Err(CommandError::Unsupported(format!(
            "cannot signal process {} on this platform",
            self.pid
        )))
    }
}

/// Waits on `context` for the child-exited flag, giving up after `exit_timeout`.
/// Returns `true` if the flag was set on time.
pub fn wait_exit_timeout(context: Context<bool>, exit_timeout: Duration) -> bool {
    context.wait_cancelled_timeout(exit_timeout)
}
