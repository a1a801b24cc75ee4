//! Client side of the checkpoint worker: request correlation, supervision and
//! the snapshot-on-mutation policy.

mod link;
mod manager;
mod policy;

pub use manager::{CheckpointManager, CheckpointSettings, WorkerMode};
pub use marshal_checkpoint::{CheckpointHandle, RestoreSummary};
pub use policy::{CheckpointHook, SnapshotPolicy};

use marshal_checkpoint::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint worker did not answer within {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("checkpoint worker exited before answering")]
    WorkerExited,

    #[error("failed to start checkpoint worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("invalid file set: {0}")]
    InvalidFileSet(#[source] StoreError),

    #[error("checkpoint worker rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected reply from checkpoint worker: {0}")]
    Protocol(String),
}
