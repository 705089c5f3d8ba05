use super::logging::OutputStream;
use thiserror::Error;

/// Failures while spawning, draining or signalling the supervised command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("child {0} was not captured")]
    PipeNotCaptured(OutputStream),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[cfg(target_family = "unix")]
    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::Error),

    #[error("{0}")]
    Unsupported(String),
}
