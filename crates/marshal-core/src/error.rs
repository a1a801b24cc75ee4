use thiserror::Error;

use crate::checkpoint::CheckpointError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("Unknown agent type: {0}")]
    UnknownAgent(String),
    #[error("Cancelled")]
    Cancelled,
}
