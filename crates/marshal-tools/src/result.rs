use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

/// The resolved value of a tool call: the executor's output, or a structured failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ToolResult {
    Output(Value),
    Error(ToolError),
}

impl ToolResult {
    /// Serializes a typed tool output. Serialization failures become internal errors.
    pub fn from_output<T: Serialize>(output: &T) -> Self {
        match serde_json::to_value(output) {
            Ok(value) => ToolResult::Output(value),
            Err(e) => ToolResult::Error(ToolError::internal(format!(
                "failed to serialize tool output: {e}"
            ))),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Error(_))
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            ToolResult::Output(value) => Some(value),
            ToolResult::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ToolError> {
        match self {
            ToolResult::Output(_) => None,
            ToolResult::Error(error) => Some(error),
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(error: ToolError) -> Self {
        ToolResult::Error(error)
    }
}

impl From<Result<Value, ToolError>> for ToolResult {
    fn from(result: Result<Value, ToolError>) -> Self {
        match result {
            Ok(value) => ToolResult::Output(value),
            Err(error) => ToolResult::Error(error),
        }
    }
}
