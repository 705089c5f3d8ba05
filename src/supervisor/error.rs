use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("maximum restart limit ({max_restarts}) reached after {restarts} restarts")]
    RestartLimitExceeded { restarts: u32, max_restarts: u32 },

    #[error("invalid command: `{0}`")]
    InvalidCommand(String),
}
