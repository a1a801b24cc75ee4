// Orchestration core for Marshal, without transport or provider dependencies

pub mod agents;
pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod detectors;
pub mod error;
pub mod runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use agents::{AgentCatalog, AgentDefinition, AgentRun, RunOutcome, RunStatus, TerminalReason};
pub use channel::{ClientConnection, RemoteExecutor, ToolCallChannel};
pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use runtime::{OrchestrationSession, SessionBuilder};
