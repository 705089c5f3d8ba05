use super::error::SupervisorError;
use super::restart_policy::MaxRestarts;
use std::fmt;
use std::process::ExitStatus;

/// Why the restart loop reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ShutdownRequested,
    TestCompleted,
    RestartLimitExceeded,
}

/// What happened to the last launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClassification {
    /// Shutdown arrived before anything was launched.
    NotLaunched,
    Exited(ExitStatus),
    SpawnFailed(String),
    WaitFailed(String),
}

impl fmt::Display for ExitClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitClassification::NotLaunched => write!(f, "not launched"),
            ExitClassification::Exited(status) => write!(f, "{status}"),
            ExitClassification::SpawnFailed(err) => write!(f, "spawn failed: {err}"),
            ExitClassification::WaitFailed(err) => write!(f, "wait failed: {err}"),
        }
    }
}

/// Final record of a supervisor session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub restarts: u32,
    pub reason: StopReason,
    pub last_exit: ExitClassification,
    pub(crate) max_restarts: MaxRestarts,
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        self.reason != StopReason::RestartLimitExceeded
    }

    /// Process exit code for the watchdog binary.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Surfaces an exceeded restart limit as an error. Every other reason is a clean stop.
    pub fn into_result(self) -> Result<Self, SupervisorError> {
        match (self.reason, self.max_restarts) {
            (StopReason::RestartLimitExceeded, MaxRestarts::Limited(max_restarts)) => {
                Err(SupervisorError::RestartLimitExceeded {
                    restarts: self.restarts,
                    max_restarts,
                })
            }
            _ => Ok(self),
        }
    }
}
