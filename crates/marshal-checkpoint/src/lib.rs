//! Checkpoint storage and the worker protocol that fronts it.
//!
//! Each project gets a bare git repository under the store root. A checkpoint
//! is a commit whose tree holds exactly the project-relative paths it covers,
//! so unchanged files are stored once no matter how many checkpoints
//! reference them.

pub mod error;
pub mod paths;
pub mod protocol;
pub mod store;
pub mod worker;

pub use error::{StoreError, StoreResult};
pub use protocol::{CheckpointHandle, Operation, RestoreSummary, WorkerReply, WorkerRequest};
pub use store::ObjectStore;
pub use worker::CheckpointWorker;

/// Default location of the object store when none is configured.
pub fn default_store_root() -> Option<std::path::PathBuf> {
    dirs::data_dir().map(|dir| dir.join("marshal").join("checkpoints"))
}
