use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Machine-readable class of a tool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolErrorKind {
    Transport,
    Timeout,
    Decoding,
    Remote,
    UnknownTool,
    NotPermitted,
    InvalidParams,
    Cancelled,
    Internal,
}

/// A tool failure delivered to the issuer as a value, never thrown across a
/// suspension point.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ToolError {
    #[error("{tool_name}: executor unreachable: {message}")]
    Transport { tool_name: String, message: String },

    #[error("{tool_name} timed out after {after_ms}ms")]
    Timeout { tool_name: String, after_ms: u64 },

    #[error("{tool_name}: malformed result: {message}")]
    Decoding { tool_name: String, message: String },

    #[error("{tool_name} failed: {message}")]
    Remote { tool_name: String, message: String },

    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("{tool_name} is not available to {agent_type}")]
    NotPermitted {
        tool_name: String,
        agent_type: String,
    },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParams { tool_name: String, message: String },

    #[error("{tool_name} was cancelled")]
    Cancelled { tool_name: String },

    #[error("Unexpected error: {message}")]
    Internal { message: String },
}

impl ToolError {
    pub fn transport<T: Into<String>, M: Into<String>>(tool_name: T, message: M) -> Self {
        ToolError::Transport {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn decoding<T: Into<String>, M: Into<String>>(tool_name: T, message: M) -> Self {
        ToolError::Decoding {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn remote<T: Into<String>, M: Into<String>>(tool_name: T, message: M) -> Self {
        ToolError::Remote {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_params<T: Into<String>, M: Into<String>>(tool_name: T, message: M) -> Self {
        ToolError::InvalidParams {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    pub fn cancelled<T: Into<String>>(tool_name: T) -> Self {
        ToolError::Cancelled {
            tool_name: tool_name.into(),
        }
    }

    pub fn internal<M: Into<String>>(message: M) -> Self {
        ToolError::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::Transport { .. } => ToolErrorKind::Transport,
            ToolError::Timeout { .. } => ToolErrorKind::Timeout,
            ToolError::Decoding { .. } => ToolErrorKind::Decoding,
            ToolError::Remote { .. } => ToolErrorKind::Remote,
            ToolError::UnknownTool { .. } => ToolErrorKind::UnknownTool,
            ToolError::NotPermitted { .. } => ToolErrorKind::NotPermitted,
            ToolError::InvalidParams { .. } => ToolErrorKind::InvalidParams,
            ToolError::Cancelled { .. } => ToolErrorKind::Cancelled,
            ToolError::Internal { .. } => ToolErrorKind::Internal,
        }
    }
}
