use async_trait::async_trait;
use marshal_tools::ToolRequest;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("remote executor unreachable: {0}")]
    Unreachable(String),
    #[error("connection closed before a reply arrived")]
    Closed,
}

/// The client side that actually performs tool calls.
///
/// Implementations return the raw reply body; the channel validates its shape.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, request: ToolRequest) -> Result<Value, TransportError>;
}
