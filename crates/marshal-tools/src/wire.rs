//! Envelopes exchanged with the remote executor.
//!
//! Requests carry `{id, issuer, toolName, input}`. Replies must be an object
//! with exactly one of `output` (any JSON value) or `errorMessage` (a string);
//! anything else is rejected as a decoding error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::ids::{RunId, ToolCallId};
use crate::result::ToolResult;
use crate::schema::ToolCall;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    pub id: ToolCallId,
    pub issuer: RunId,
    pub tool_name: String,
    pub input: Value,
}

impl ToolRequest {
    pub fn from_call(issuer: RunId, call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            issuer,
            tool_name: call.name.clone(),
            input: call.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolReply {
    Output(Value),
    ErrorMessage(String),
}

impl ToolReply {
    pub fn decode(body: Value) -> Result<Self, String> {
        let Value::Object(mut fields) = body else {
            return Err(format!("expected an object, got {}", value_kind(&body)));
        };

        match (fields.remove("output"), fields.remove("errorMessage")) {
            (Some(output), None) => Ok(ToolReply::Output(output)),
            (None, Some(Value::String(message))) => Ok(ToolReply::ErrorMessage(message)),
            (None, Some(other)) => Err(format!(
                "errorMessage must be a string, got {}",
                value_kind(&other)
            )),
            (Some(_), Some(_)) => Err("reply carries both output and errorMessage".to_string()),
            (None, None) => Err("reply carries neither output nor errorMessage".to_string()),
        }
    }

    pub fn into_result(self, tool_name: &str) -> ToolResult {
        match self {
            ToolReply::Output(value) => ToolResult::Output(value),
            ToolReply::ErrorMessage(message) => ToolResult::Error(ToolError::remote(tool_name, message)),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ToolReply::Output(value) => serde_json::json!({ "output": value }),
            ToolReply::ErrorMessage(message) => serde_json::json!({ "errorMessage": message }),
        }
    }
}

/// Decodes a raw reply body into the result delivered to the issuer.
pub fn decode_reply(tool_name: &str, body: Value) -> ToolResult {
    match ToolReply::decode(body) {
        Ok(reply) => reply.into_result(tool_name),
        Err(message) => ToolResult::Error(ToolError::decoding(tool_name, message)),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
