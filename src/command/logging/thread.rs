use super::OutputStream;
use crate::logging::session::SessionLog;
use std::io::{BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};
use tracing::{error, info, Level};

/// Drains `handle` line by line on a dedicated thread until EOF, mirroring every line to the
/// console and to the session log. The thread ends when the child closes its end of the pipe.
pub(crate) fn spawn_logger<R>(
    handle: R,
    stream: OutputStream,
    session_log: SessionLog,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("child-{stream}"))
        .spawn(move || drain_lines(handle, stream, &session_log))
}

fn drain_lines<R: Read>(handle: R, stream: OutputStream, session_log: &SessionLog) {
    let mut reader = BufReader::new(handle);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                info!(%stream, "{}", line);
                session_log.record(Level::INFO, format_args!("[{stream}] {line}"));
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!(%stream, "stream error: {}", err);
                break;
            }
        }
    }
}
