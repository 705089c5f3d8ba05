use super::error::CommandError;
use super::logging::{thread::spawn_logger, OutputStream};
use crate::logging::session::SessionLog;
use crate::supervisor::config::SupervisedCommand;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long the output readers get, once the child exited, to flush what is left in the pipes.
/// Grandchildren that inherited the pipes can keep them open forever, so the wait is bounded.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

////////////////////////////////////////////////////////////////////////////////////
// States for Started/Not Started Command
////////////////////////////////////////////////////////////////////////////////////
pub struct CommandOSNotStarted {
    cmd: Command,
    session_log: SessionLog,
}

pub struct CommandOSStarted {
    process: Child,
    session_log: SessionLog,
    loggers: Vec<JoinHandle<()>>,
}

////////////////////////////////////////////////////////////////////////////////////
// Not Started Command OS
////////////////////////////////////////////////////////////////////////////////////
impl CommandOSNotStarted {
    pub fn new(command: &SupervisedCommand, session_log: SessionLog) -> Self {
        let mut cmd = Command::new(command.bin());
        cmd.args(command.args())
            .envs(command.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = command.working_dir() {
            cmd.current_dir(dir);
        }

        // The child leads its own process group so the whole tree can be signalled at once.
        #[cfg(target_family = "unix")]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        Self { cmd, session_log }
    }

    pub fn start(mut self) -> Result<CommandOSStarted, CommandError> {
        let process = self.cmd.spawn()?;
        Ok(CommandOSStarted {
            process,
            session_log: self.session_log,
            loggers: Vec::with_capacity(2),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////
// Started Command OS
////////////////////////////////////////////////////////////////////////////////////
impl CommandOSStarted {
    pub fn get_pid(&self) -> u32 {
        self.process.id()
    }

    /// Starts one reader thread per output pipe. On failure the child is killed, since nobody
    /// would be left to drain its output.
    pub fn stream(mut self) -> Result<Self, CommandError> {
        match self.spawn_loggers() {
            Ok(()) => Ok(self),
            Err(err) => {
                _ = self.process.kill();
                _ = self.process.wait();
                Err(err)
            }
        }
    }

    fn spawn_loggers(&mut self) -> Result<(), CommandError> {
        let stdout = self
            .process
            .stdout
            .take()
            .ok_or(CommandError::PipeNotCaptured(OutputStream::Stdout))?;

        let stderr = self
            .process
            .stderr
            .take()
            .ok_or(CommandError::PipeNotCaptured(OutputStream::Stderr))?;

        self.loggers.push(spawn_logger(
            stdout,
            OutputStream::Stdout,
            self.session_log.clone(),
        )?);
        self.loggers.push(spawn_logger(
            stderr,
            OutputStream::Stderr,
            self.session_log.clone(),
        )?);
        Ok(())
    }

    /// Blocks until the child exits, then gives the output readers a bounded window to finish.
    pub fn wait(mut self) -> Result<ExitStatus, CommandError> {
        let status = self.wait_exit()?;
        self.drain_output();
        Ok(status)
    }

    /// Blocks until the child exits. Its output may still be in flight, see
    /// [`CommandOSStarted::drain_output`].
    pub fn wait_exit(&mut self) -> Result<ExitStatus, CommandError> {
        Ok(self.process.wait()?)
    }

    /// Gives the output readers [`OUTPUT_DRAIN_TIMEOUT`] to flush what is left in the pipes.
    pub fn drain_output(mut self) {
        self.await_loggers(OUTPUT_DRAIN_TIMEOUT);
    }

    fn await_loggers(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.loggers.iter().any(|l| !l.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }

        let (finished, pending): (Vec<_>, Vec<_>) =
            self.loggers.drain(..).partition(JoinHandle::is_finished);
        finished.into_iter().for_each(|l| _ = l.join());
        if !pending.is_empty() {
            debug!(
                pid = self.process.id(),
                "output pipes still open after the process exited, detaching readers"
            );
        }
    }
}

#[cfg(target_family = "unix")]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn sh(script: &str) -> SupervisedCommand {
        SupervisedCommand::new(PathBuf::from("sh"))
            .with_args(vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_output_is_captured_before_wait_returns() {
        let tmp = tempdir().unwrap();
        let (log, guard) = SessionLog::create(tmp.path()).unwrap();

        let status = CommandOSNotStarted::new(&sh("echo out; echo err >&2; exit 3"), log.clone())
            .start()
            .unwrap()
            .stream()
            .unwrap()
            .wait()
            .unwrap();
        drop(guard);

        assert_eq!(Some(3), status.code());
        let content = fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("INFO - [stdout] out"));
        assert!(content.contains("INFO - [stderr] err"));
    }

    #[test]
    fn test_env_and_working_dir_are_applied() {
        let tmp = tempdir().unwrap();
        let (log, guard) = SessionLog::create(tmp.path()).unwrap();
        let workdir = tempdir().unwrap();

        let command = sh("echo \"$WATCHDOG_MODE\"; pwd")
            .with_env(HashMap::from([(
                "WATCHDOG_MODE".to_string(),
                "camera-only".to_string(),
            )]))
            .with_working_dir(workdir.path().to_path_buf());

        CommandOSNotStarted::new(&command, log.clone())
            .start()
            .unwrap()
            .stream()
            .unwrap()
            .wait()
            .unwrap();
        drop(guard);

        let content = fs::read_to_string(log.path()).unwrap();
        let workdir = fs::canonicalize(workdir.path()).unwrap();
        assert!(content.contains("[stdout] camera-only"));
        assert!(content.contains(&format!("[stdout] {}", workdir.display())));
    }

    #[test]
    fn test_missing_binary_fails_to_start() {
        let tmp = tempdir().unwrap();
        let (log, _guard) = SessionLog::create(tmp.path()).unwrap();

        let result = CommandOSNotStarted::new(
            &SupervisedCommand::new(PathBuf::from("/nonexistent/detector")),
            log,
        )
        .start();

        assert!(matches!(result, Err(CommandError::Io(_))));
    }

    #[test]
    fn test_child_leads_its_own_process_group() {
        let tmp = tempdir().unwrap();
        let (log, _guard) = SessionLog::create(tmp.path()).unwrap();

        let started = CommandOSNotStarted::new(&sh("sleep 0.2"), log)
            .start()
            .unwrap()
            .stream()
            .unwrap();
        let pid = nix::unistd::Pid::from_raw(started.get_pid() as i32);

        assert_eq!(pid, nix::unistd::getpgid(Some(pid)).unwrap());
        started.wait().unwrap();
    }

    #[test]
    fn test_exit_is_reported_while_a_grandchild_holds_the_pipes() {
        let tmp = tempdir().unwrap();
        let (log, _guard) = SessionLog::create(tmp.path()).unwrap();

        let mut started = CommandOSNotStarted::new(&sh("sleep 5 & exit 4"), log)
            .start()
            .unwrap()
            .stream()
            .unwrap();
        let pid = nix::unistd::Pid::from_raw(started.get_pid() as i32);

        let timer = Instant::now();
        let status = started.wait_exit().unwrap();

        assert_eq!(Some(4), status.code());
        assert!(timer.elapsed() < Duration::from_secs(1));

        nix::sys::signal::killpg(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        started.drain_output();
    }
}
