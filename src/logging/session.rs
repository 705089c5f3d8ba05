use super::config::LoggingError;
use chrono::Local;
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{error, Level};
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};

const SESSION_LOG_PREFIX: &str = "watchdog";
const FILE_NAME_TIMESTAMP: &str = "%Y%m%d_%H%M%S";
const LINE_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S,%3f";

/// Append-only, timestamped log file created for one supervisor session.
///
/// Every clone feeds the same background worker, which is the only thread touching the file.
/// A call to [`SessionLog::record`] is sent to it as one message, so lines coming from the
/// stdout and stderr readers and from the supervisor loop never interleave.
#[derive(Clone, Debug)]
pub struct SessionLog {
    writer: NonBlocking,
    path: PathBuf,
}

/// Keeps the session log worker alive. Dropping it flushes every pending line to disk.
#[must_use = "dropping the guard stops the session log writer"]
pub struct SessionLogGuard {
    _worker_guard: WorkerGuard,
}

impl SessionLog {
    /// Creates `dir` if needed and opens a brand new `watchdog_<timestamp>.log` inside it.
    /// An existing file is never reused: a numeric suffix is added when the name is taken.
    pub fn create(dir: &Path) -> Result<(Self, SessionLogGuard), LoggingError> {
        fs::create_dir_all(dir)?;
        let stamp = Local::now().format(FILE_NAME_TIMESTAMP).to_string();
        let (file, path) = create_fresh_file(dir, &stamp)?;

        let (writer, guard) = NonBlockingBuilder::default()
            .lossy(false)
            .thread_name("session-log-writer")
            .finish(file);

        Ok((
            Self { writer, path },
            SessionLogGuard {
                _worker_guard: guard,
            },
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `<timestamp> - <LEVEL> - <message>` as a single line.
    pub fn record(&self, level: Level, message: impl Display) {
        let line = format!(
            "{} - {} - {}\n",
            Local::now().format(LINE_TIMESTAMP),
            level,
            message
        );
        let mut writer = self.writer.clone();
        if let Err(err) = writer.write_all(line.as_bytes()) {
            error!(path = %self.path.display(), "could not write to session log: {}", err);
        }
    }
}

fn create_fresh_file(dir: &Path, stamp: &str) -> Result<(File, PathBuf), LoggingError> {
    let mut suffix = 0u32;
    loop {
        let file_name = match suffix {
            0 => format!("{SESSION_LOG_PREFIX}_{stamp}.log"),
            n => format!("{SESSION_LOG_PREFIX}_{stamp}_{n}.log"),
        };
        let path = dir.join(file_name);
        match OpenOptions::new().append(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(err) => return Err(err.into()),
        }
    }
}
