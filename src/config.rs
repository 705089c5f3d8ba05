use crate::command::shutdown::DEFAULT_GRACE_PERIOD;
use crate::logging::config::LoggingConfig;
use crate::supervisor::restart_policy::{
    BackoffStrategy, DEFAULT_RESTART_DELAY, LAST_RETRY_INTERVAL,
};
use duration_str::deserialize_duration;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config: `{0}`")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Watchdog configuration file. Every section is optional and command line flags take precedence.
///
/// ```yaml
/// command:
///   path: ./run_integrated_detection_system.sh
///   args: ["--fps", "30"]
///   env:
///     DEPTHAI_LEVEL: info
///   working_dir: /opt/detector
/// restart_policy:
///   restart_delay: 5s
///   max_restarts: 10
///   backoff: exponential
/// grace_period: 10s
/// log:
///   level: debug
///   dir: /var/log/watchdog
/// ```
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct WatchdogConfig {
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub restart_policy: RestartPolicyConfig,
    #[serde(default = "default_grace_period", deserialize_with = "deserialize_duration")]
    pub grace_period: Duration,
    #[serde(default)]
    pub log: LoggingConfig,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            command: CommandConfig::default(),
            restart_policy: RestartPolicyConfig::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            log: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct RestartPolicyConfig {
    #[serde(
        default = "default_restart_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub restart_delay: Duration,
    /// Unlimited when absent.
    pub max_restarts: Option<u32>,
    #[serde(default)]
    pub test: bool,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(
        default = "default_last_retry_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub last_retry_interval: Duration,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            restart_delay: DEFAULT_RESTART_DELAY,
            max_restarts: None,
            test: false,
            backoff: BackoffStrategy::default(),
            last_retry_interval: LAST_RETRY_INTERVAL,
        }
    }
}

fn default_grace_period() -> Duration {
    DEFAULT_GRACE_PERIOD
}

fn default_restart_delay() -> Duration {
    DEFAULT_RESTART_DELAY
}

fn default_last_retry_interval() -> Duration {
    LAST_RETRY_INTERVAL
}

impl WatchdogConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self
            .command
            .path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(ConfigError::Invalid(
                "command.path must not be empty".to_string(),
            ));
        }
        if self
            .command
            .working_dir
            .as_ref()
            .is_some_and(|dir| !dir.is_dir())
        {
            return Err(ConfigError::Invalid(format!(
                "command.working_dir `{}` is not a directory",
                self.command.working_dir.unwrap_or_default().display()
            )));
        }
        Ok(self)
    }
}

impl std::str::FromStr for WatchdogConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // An empty file is a valid config made only of defaults
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str::<WatchdogConfig>(s)?.validate()
    }
}
