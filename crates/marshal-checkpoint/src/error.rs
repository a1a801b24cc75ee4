use std::path::PathBuf;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid path in file set: {0}")]
    InvalidPath(String),

    #[error("Invalid checkpoint handle: {0}")]
    InvalidHandle(String),

    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Checkpoint repository error at {}: {message}", path.display())]
    Repository { path: PathBuf, message: String },

    #[error("Corrupt object {id}: {message}")]
    Corrupt { id: String, message: String },

    #[error("Missing field in request: {0}")]
    MissingField(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn repository(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        StoreError::Repository {
            path: path.into(),
            message: message.into(),
        }
    }
}
