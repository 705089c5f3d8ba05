pub mod command_supervisor;
pub mod config;
pub mod error;
pub mod outcome;
pub mod restart_policy;

pub use command_supervisor::{ShutdownHandle, Supervisor};
pub use config::{SupervisedCommand, SupervisorConfig};
pub use outcome::{ExitClassification, ExitOutcome, StopReason};
pub use restart_policy::{BackoffStrategy, MaxRestarts, RestartPolicy};
