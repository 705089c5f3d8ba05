use super::config::SupervisorConfig;
use super::error::SupervisorError;
use super::outcome::{ExitClassification, ExitOutcome, StopReason};
use super::restart_policy::Backoff;
use crate::command::command_os::CommandOSNotStarted;
use crate::command::shutdown::{wait_exit_timeout, ProcessTerminator, Termination};
use crate::context::Context;
use crate::logging::session::SessionLog;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Level};

type PidSlot = Arc<Mutex<Option<u32>>>;

////////////////////////////////////////////////////////////////////////////////////
// Restart loop states
////////////////////////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Spawn the child and block until it exits.
    Launching,
    Evaluating,
    Delaying,
    Terminating,
    Stopped(StopReason),
}

/// Mutable run-time record owned by the thread running the loop.
struct SupervisorState {
    launches: u32,
    last_exit: ExitClassification,
    last_uptime: Duration,
    backoff: Backoff,
}

impl SupervisorState {
    fn restarts(&self) -> u32 {
        self.launches.saturating_sub(1)
    }

    /// Counts a new attempt. The counter sticks at its maximum under unlimited restarts.
    fn record_launch(&mut self) -> u32 {
        self.launches = self.launches.saturating_add(1);
        self.launches
    }
}

/// Cloneable handle used to stop a running [`Supervisor`] from another thread, typically the
/// signal handler.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Context<bool>);

impl ShutdownHandle {
    /// Sets the shutdown flag. The running child, if any, receives SIGTERM and, after the grace
    /// period, SIGKILL. A pending restart delay is cut short.
    pub fn request_shutdown(&self) {
        if let Err(err) = self.0.cancel_all(true) {
            error!("could not request shutdown: {}", err);
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Keeps one command alive, restarting it on every exit until the restart policy gives up, test
/// mode completes or a shutdown is requested.
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    session_log: SessionLog,
    ctx: Context<bool>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, session_log: SessionLog) -> Result<Self, SupervisorError> {
        if config.command().bin().as_os_str().is_empty() {
            return Err(SupervisorError::InvalidCommand(
                "empty executable path".to_string(),
            ));
        }
        Ok(Supervisor {
            config,
            session_log,
            ctx: Context::new(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.ctx.clone())
    }

    /// Runs the restart loop on the calling thread until a terminal state is reached.
    pub fn run(self) -> ExitOutcome {
        self.log_banner();

        let current_pid: PidSlot = Arc::new(Mutex::new(None));
        let exited_ctx = Context::new();
        let watcher = wait_for_termination(
            current_pid.clone(),
            self.ctx.clone(),
            exited_ctx.clone(),
            self.config.grace_period(),
        );

        let mut session = SupervisorState {
            launches: 0,
            last_exit: ExitClassification::NotLaunched,
            last_uptime: Duration::ZERO,
            backoff: self.config.restart_policy().backoff(),
        };

        let mut state = State::Launching;
        let reason = loop {
            state = match state {
                State::Launching => self.launch(&mut session, &current_pid, &exited_ctx),
                State::Evaluating => self.evaluate(&session),
                State::Delaying => self.delay(&mut session),
                State::Terminating => {
                    self.report(Level::INFO, "Shutdown requested, stopping watchdog");
                    State::Stopped(StopReason::ShutdownRequested)
                }
                State::Stopped(reason) => break reason,
            };
        };

        // Wakes the watcher if no shutdown was requested. With the pid slot empty it does nothing.
        if let Err(err) = self.ctx.cancel_all(true) {
            error!("could not release the shutdown watcher: {}", err);
        }
        if watcher.join().is_err() {
            error!("shutdown watcher panicked");
        }

        let outcome = ExitOutcome {
            restarts: session.restarts(),
            reason,
            last_exit: session.last_exit,
            max_restarts: self.config.restart_policy().max_restarts(),
        };
        self.report(
            Level::INFO,
            format!(
                "Watchdog stopped ({:?}) after {} restarts, last exit: {}",
                outcome.reason, outcome.restarts, outcome.last_exit
            ),
        );
        outcome
    }

    fn launch(
        &self,
        session: &mut SupervisorState,
        current_pid: &PidSlot,
        exited_ctx: &Context<bool>,
    ) -> State {
        if let Err(err) = exited_ctx.reset() {
            error!("could not reset the exit notification: {}", err);
        }

        let command = self.config.command();
        let mut started = {
            // The watcher takes this lock before signalling, so a child is either spawned here
            // and seen by the watcher, or never spawned at all once shutdown was requested.
            let mut pid_slot = lock_pid(current_pid);
            if self.ctx.is_cancelled() {
                return State::Terminating;
            }
            session.record_launch();

            self.report(
                Level::INFO,
                format!("Starting process (attempt #{}): {}", session.launches, command),
            );
            let started = CommandOSNotStarted::new(command, self.session_log.clone())
                .start()
                .and_then(|started| started.stream());
            match started {
                Ok(started) => {
                    *pid_slot = Some(started.get_pid());
                    started
                }
                Err(err) => {
                    self.report(
                        Level::ERROR,
                        format!(
                            "Failed to start process (attempt #{}): {}: {}",
                            session.launches, command, err
                        ),
                    );
                    session.last_exit = ExitClassification::SpawnFailed(err.to_string());
                    session.last_uptime = Duration::ZERO;
                    return State::Evaluating;
                }
            }
        };

        let pid = started.get_pid();
        self.report(Level::INFO, format!("Process started with PID {pid}"));
        let launched_at = Instant::now();
        let result = started.wait_exit();
        let uptime = launched_at.elapsed();

        // Must be notified before taking the pid lock, which the watcher holds while terminating.
        if let Err(err) = exited_ctx.cancel_all(true) {
            error!("could not notify the process exit: {}", err);
        }
        *lock_pid(current_pid) = None;

        // Whatever the leader left behind in its group must not outlive it
        self.stop_leftovers(pid);
        started.drain_output();

        session.last_uptime = uptime;
        session.last_exit = match result {
            Ok(status) => {
                let message = format!(
                    "Process (attempt #{}, PID {pid}) terminated with {status} after {:.1}s: {command}",
                    session.launches,
                    uptime.as_secs_f64()
                );
                if self.ctx.is_cancelled() {
                    self.report(Level::INFO, message);
                } else {
                    self.report(Level::WARN, message);
                }
                ExitClassification::Exited(status)
            }
            Err(err) => {
                self.report(
                    Level::ERROR,
                    format!(
                        "Could not wait for process (attempt #{}, PID {pid}): {err}",
                        session.launches
                    ),
                );
                ExitClassification::WaitFailed(err.to_string())
            }
        };
        State::Evaluating
    }

    /// Terminates the remaining members of the exited leader's process group. Nothing is
    /// signalled when the group is already gone.
    fn stop_leftovers(&self, pid: u32) {
        match ProcessTerminator::new(pid)
            .with_grace_period(self.config.grace_period())
            .shutdown(|_| true)
        {
            Ok(Termination::Graceful) => {}
            Ok(Termination::Killed) => debug!(pid, "leftover group members killed"),
            Err(err) => error!(pid, "could not stop leftover group members: {}", err),
        }
    }

    fn evaluate(&self, session: &SupervisorState) -> State {
        let policy = self.config.restart_policy();
        if self.ctx.is_cancelled() {
            State::Terminating
        } else if policy.test_mode() {
            self.report(Level::INFO, "Test mode enabled, not restarting");
            State::Stopped(StopReason::TestCompleted)
        } else if !policy.allows_restart(session.restarts()) {
            self.report(
                Level::ERROR,
                format!(
                    "Maximum restart limit ({}) reached, giving up",
                    policy.max_restarts()
                ),
            );
            State::Stopped(StopReason::RestartLimitExceeded)
        } else {
            State::Delaying
        }
    }

    fn delay(&self, session: &mut SupervisorState) -> State {
        let delay = session.backoff.next_delay(session.last_uptime);
        self.report(
            Level::INFO,
            format!(
                "Waiting {:.1}s before restart #{}",
                delay.as_secs_f64(),
                session.restarts() + 1
            ),
        );
        // early exit if a shutdown is requested while waiting
        if wait_exit_timeout(self.ctx.clone(), delay) {
            State::Terminating
        } else {
            State::Launching
        }
    }

    fn log_banner(&self) {
        let policy = self.config.restart_policy();
        self.report(Level::INFO, "Watchdog service initialized");
        self.report(
            Level::INFO,
            format!("Target command: {}", self.config.command()),
        );
        self.report(
            Level::INFO,
            format!(
                "Restart delay: {:.1}s ({:?} backoff)",
                policy.restart_delay().as_secs_f64(),
                policy.backoff_strategy()
            ),
        );
        self.report(
            Level::INFO,
            format!("Max restarts: {}", policy.max_restarts()),
        );
        if policy.test_mode() {
            self.report(Level::INFO, "Test mode: the command runs once");
        }
    }

    /// Logs to the console and appends the same line to the session log.
    fn report(&self, level: Level, message: impl Display) {
        match level {
            Level::ERROR => error!("{}", message),
            Level::WARN => warn!("{}", message),
            Level::INFO => info!("{}", message),
            _ => debug!("{}", message),
        }
        self.session_log.record(level, message);
    }
}

fn lock_pid(current_pid: &PidSlot) -> MutexGuard<'_, Option<u32>> {
    current_pid.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Blocks on the [`Context`] `ctx`. When the termination signal is activated, this will send a
/// shutdown signal to the process group being supervised, if any is running.
fn wait_for_termination(
    current_pid: PidSlot,
    ctx: Context<bool>,
    exited_ctx: Context<bool>,
    grace_period: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || {
        ctx.wait_cancelled();

        let pid_slot = lock_pid(&current_pid);
        if let Some(pid) = *pid_slot {
            info!(pid, "Stopping supervised process");
            match ProcessTerminator::new(pid)
                .with_grace_period(grace_period)
                .shutdown(|grace| wait_exit_timeout(exited_ctx, grace))
            {
                Ok(Termination::Graceful) => debug!(pid, "process stopped gracefully"),
                Ok(Termination::Killed) => debug!(pid, "process killed"),
                Err(err) => error!(pid, "could not stop the supervised process: {}", err),
            }
        }
    })
}
