use super::restart_policy::RestartPolicy;
use crate::command::shutdown::DEFAULT_GRACE_PERIOD;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The command line the supervisor keeps alive. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisedCommand {
    bin: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl SupervisedCommand {
    pub fn new(bin: PathBuf) -> Self {
        SupervisedCommand {
            bin,
            args: Vec::default(),
            env: HashMap::default(),
            working_dir: None,
        }
    }

    pub fn with_args(self, args: Vec<String>) -> Self {
        Self { args, ..self }
    }

    /// Variables set on top of the environment inherited from the supervisor.
    pub fn with_env(self, env: HashMap<String, String>) -> Self {
        Self { env, ..self }
    }

    pub fn with_working_dir(self, working_dir: PathBuf) -> Self {
        Self {
            working_dir: Some(working_dir),
            ..self
        }
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }
}

impl fmt::Display for SupervisedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bin.display())?;
        self.args.iter().try_for_each(|arg| write!(f, " {arg}"))
    }
}

/// Everything a [`Supervisor`](super::command_supervisor::Supervisor) needs besides its session log.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub(crate) command: SupervisedCommand,
    pub(crate) restart_policy: RestartPolicy,
    pub(crate) grace_period: Duration,
}

impl SupervisorConfig {
    pub fn new(command: SupervisedCommand, restart_policy: RestartPolicy) -> Self {
        SupervisorConfig {
            command,
            restart_policy,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(self, grace_period: Duration) -> Self {
        Self {
            grace_period,
            ..self
        }
    }

    pub fn command(&self) -> &SupervisedCommand {
        &self.command
    }

    pub fn restart_policy(&self) -> &RestartPolicy {
        &self.restart_policy
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}
