use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::{debug, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::PrettyFields;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Directory where session logs are written when nothing else is configured.
pub const DEFAULT_LOG_DIR: &str = "logs";

const DEFAULT_CONSOLE_TIMESTAMP: &str = "%Y-%m-%dT%H:%M:%S";
const LOG_LEVEL_ENV_VAR: &str = "LOG_LEVEL";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("could not set up console logging: `{0}`")]
    ConsoleInit(String),
    #[error("could not create session log: `{0}`")]
    SessionLog(#[from] std::io::Error),
}

/// Console and session log settings, the `log` section of the config file.
///
/// `level` only applies to events emitted by this crate, and `LOG_LEVEL` takes precedence over it
/// with the usual `EnvFilter` directive syntax.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub(crate) format: ConsoleFormat,
    #[serde(default)]
    pub(crate) level: WatchdogLevel,
    #[serde(default = "default_log_dir")]
    pub(crate) dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: ConsoleFormat::default(),
            level: WatchdogLevel::default(),
            dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

/// How console lines look. The session log format is fixed.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct ConsoleFormat {
    #[serde(default)]
    pub(crate) target: bool,
    /// [chrono strftime](https://docs.rs/chrono/latest/chrono/format/strftime/index.html) pattern
    #[serde(default = "default_console_timestamp")]
    pub(crate) timestamp: String,
}

impl Default for ConsoleFormat {
    fn default() -> Self {
        Self {
            target: false,
            timestamp: default_console_timestamp(),
        }
    }
}

fn default_console_timestamp() -> String {
    DEFAULT_CONSOLE_TIMESTAMP.to_string()
}

impl LoggingConfig {
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn with_dir(self, dir: PathBuf) -> Self {
        Self { dir, ..self }
    }

    /// Installs the global console subscriber. Fails if one is already installed.
    pub fn try_init(&self) -> Result<(), LoggingError> {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(self.env_filter())
            .with_target(self.format.target)
            .with_timer(ChronoLocal::new(self.format.timestamp.clone()))
            .fmt_fields(PrettyFields::new());

        subscriber
            .try_init()
            .map_err(|err| LoggingError::ConsoleInit(err.to_string()))?;

        debug!(session_log_dir = %self.dir.display(), "console logging ready");
        Ok(())
    }

    fn env_filter(&self) -> EnvFilter {
        // Child output lines are emitted by this crate too, so the directive covers both.
        let directive = format!("{}={}", env!("CARGO_CRATE_NAME"), self.level)
            .parse::<Directive>()
            .unwrap_or_else(|_| LevelFilter::INFO.into());

        EnvFilter::builder()
            .with_default_directive(directive)
            .with_env_var(LOG_LEVEL_ENV_VAR)
            .from_env_lossy()
    }
}

/// Minimum level for this crate's events, parsed from names such as `debug` or `WARN`.
#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[serde(try_from = "String")]
pub(crate) struct WatchdogLevel(Level);

impl Default for WatchdogLevel {
    fn default() -> Self {
        Self(Level::INFO)
    }
}

impl TryFrom<String> for WatchdogLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Level::from_str(&value)
            .map(WatchdogLevel)
            .map_err(|_| format!("unknown log level `{value}`"))
    }
}

impl std::fmt::Display for WatchdogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string().to_lowercase())
    }
}
