use async_trait::async_trait;
use marshal_tools::{RunId, ToolSchema};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agents::RunHistory;

/// Everything the model side needs to produce the next turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub run_id: RunId,
    pub agent_type: String,
    pub history: RunHistory,
    /// Names of every tool the agent may call.
    pub tools: Vec<String>,
    /// Schemas of the orchestration tools among `tools`.
    pub orchestration_schemas: Vec<ToolSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedCall {
    pub name: String,
    pub input: Value,
}

impl ProposedCall {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnResponse {
    pub text: String,
    pub tool_calls: Vec<ProposedCall>,
    /// The model considers its work done.
    pub end_turn: bool,
}

impl TurnResponse {
    pub fn text(text: impl Into<String>, end_turn: bool) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            end_turn,
        }
    }

    pub fn with_call(mut self, name: impl Into<String>, input: Value) -> Self {
        self.tool_calls.push(ProposedCall::new(name, input));
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("model call failed: {0}")]
    Model(String),
    #[error("turn cancelled")]
    Cancelled,
}

/// Produces one model-driven turn for a run. Provider specifics live behind
/// this trait.
#[async_trait]
pub trait TurnEngine: Send + Sync {
    async fn next_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnResponse, TurnError>;
}
