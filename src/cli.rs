use crate::config::{ConfigError, WatchdogConfig};
use crate::logging::config::LoggingConfig;
use crate::supervisor::config::{SupervisedCommand, SupervisorConfig};
use crate::supervisor::restart_policy::{BackoffStrategy, RestartPolicy};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Launcher supervised when neither the command line nor the config file names one.
pub const DEFAULT_SCRIPT_PATH: &str = "./run_integrated_detection_system.sh";
const CAMERA_ONLY_ARG: &str = "--camera-only";

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("could not make `{}` executable: {source}", .path.display())]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Keeps a detection pipeline launcher running, restarting it whenever it exits.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Cli {
    /// Script or binary to supervise [default: ./run_integrated_detection_system.sh]
    #[arg(short, long)]
    script_path: Option<PathBuf>,

    /// Do not pass `--camera-only` to the supervised command
    #[arg(long)]
    no_camera_only: bool,

    /// Delay before each restart, in seconds or as a duration string (`500ms`, `1m`) [default: 5s]
    #[arg(short = 'd', long, value_parser = parse_duration_arg)]
    restart_delay: Option<Duration>,

    /// Maximum number of restarts before giving up [default: unlimited]
    #[arg(short, long)]
    max_restarts: Option<u32>,

    /// Run the command once and exit without restarting it
    #[arg(long)]
    test: bool,

    /// YAML configuration file. Command line flags take precedence over its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How the restart delay grows on consecutive failures [default: fixed]
    #[arg(long, value_enum)]
    backoff: Option<BackoffStrategy>,

    /// Time the command gets to exit after SIGTERM before it is killed [default: 10s]
    #[arg(long, value_parser = parse_duration_arg)]
    grace_period: Option<Duration>,

    /// Directory for the session log files [default: logs]
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Extra arguments forwarded as-is to the supervised command
    #[arg(last = true)]
    forwarded_args: Vec<String>,
}

/// Everything the binary needs once arguments and config file are merged.
#[derive(Debug)]
pub struct WatchdogSetup {
    pub supervisor: SupervisorConfig,
    pub logging: LoggingConfig,
    pub camera_only: bool,
}

impl Cli {
    /// Parses command line arguments
    pub fn init() -> Self {
        Self::parse()
    }

    /// Loads the config file, if any, and applies the command line on top of it. The script is
    /// validated and made executable on the way.
    pub fn resolve(self) -> Result<WatchdogSetup, CliError> {
        let config = match &self.config {
            Some(path) => WatchdogConfig::load(path)?,
            None => WatchdogConfig::default(),
        };

        let script = self
            .script_path
            .or(config.command.path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRIPT_PATH));
        let script = prepare_script(&script)?;

        let camera_only = !self.no_camera_only;
        let mut args = config.command.args;
        if camera_only {
            args.push(CAMERA_ONLY_ARG.to_string());
        }
        args.extend(self.forwarded_args);

        let mut command = SupervisedCommand::new(script)
            .with_args(args)
            .with_env(config.command.env);
        if let Some(dir) = config.command.working_dir {
            command = command.with_working_dir(dir);
        }

        let file_policy = config.restart_policy;
        let restart_policy =
            RestartPolicy::new(self.restart_delay.unwrap_or(file_policy.restart_delay))
                .with_max_restarts(self.max_restarts.or(file_policy.max_restarts).into())
                .with_test_mode(self.test || file_policy.test)
                .with_backoff(self.backoff.unwrap_or(file_policy.backoff))
                .with_last_retry_interval(file_policy.last_retry_interval);

        let supervisor = SupervisorConfig::new(command, restart_policy)
            .with_grace_period(self.grace_period.unwrap_or(config.grace_period));

        let logging = match self.log_dir {
            Some(dir) => config.log.with_dir(dir),
            None => config.log,
        };

        Ok(WatchdogSetup {
            supervisor,
            logging,
            camera_only,
        })
    }
}

// helper needed because the arguments from the duration_str's parse function and the one expected by the clap
// `value_parser` argument have incompatible lifetimes.
fn parse_duration_arg(arg: &str) -> Result<Duration, String> {
    duration_str::parse(arg).map_err(|err| err.to_string())
}

/// Resolves `path` to an absolute path and makes sure it can be executed.
pub fn prepare_script(path: &Path) -> Result<PathBuf, CliError> {
    let script = fs::canonicalize(path).map_err(|_| CliError::ScriptNotFound(path.to_path_buf()))?;
    if !script.is_file() {
        return Err(CliError::ScriptNotFound(path.to_path_buf()));
    }

    #[cfg(target_family = "unix")]
    ensure_executable(&script)?;

    Ok(script)
}

#[cfg(target_family = "unix")]
fn ensure_executable(script: &Path) -> Result<(), CliError> {
    use std::os::unix::fs::PermissionsExt;

    let permissions_error = |source| CliError::Permissions {
        path: script.to_path_buf(),
        source,
    };
    let mode = fs::metadata(script)
        .map_err(permissions_error)?
        .permissions()
        .mode();
    if mode & 0o100 == 0 {
        debug!(script = %script.display(), "setting script permissions to 0755");
        fs::set_permissions(script, fs::Permissions::from_mode(0o755))
            .map_err(permissions_error)?;
    }
    Ok(())
}
