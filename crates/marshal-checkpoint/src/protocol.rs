use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};

/// Opaque reference to a stored checkpoint (the hex id of its git commit).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointHandle(String);

impl CheckpointHandle {
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let raw = raw.trim();
        if raw.len() == 40 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(raw.to_ascii_lowercase()))
        } else {
            Err(StoreError::InvalidHandle(raw.to_string()))
        }
    }

    pub(crate) fn from_object_id(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Store,
    Restore,
}

/// One line of the worker's input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub id: u64,
    pub operation: Operation,
    pub project_dir: PathBuf,
    pub file_set: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_handle: Option<String>,
}

/// One line of the worker's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerReply {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// What a restore touched, relative to the project directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub written: Vec<String>,
    pub deleted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case_fields() {
        let request: WorkerRequest = serde_json::from_value(json!({
            "id": 7,
            "operation": "restore",
            "projectDir": "/tmp/project",
            "fileSet": ["a.txt"],
            "checkpointHandle": "ab"
        }))
        .expect("decode request");
        assert_eq!(request.operation, Operation::Restore);
        assert_eq!(request.checkpoint_handle.as_deref(), Some("ab"));
        assert_eq!(request.label, None);
    }

    #[test]
    fn failed_reply_omits_result() {
        let value = serde_json::to_value(WorkerReply::failed(3, "boom")).expect("serialize");
        assert_eq!(value, json!({ "id": 3, "success": false, "error": "boom" }));
    }

    #[test]
    fn handles_must_be_commit_ids() {
        assert!(CheckpointHandle::parse(&"A".repeat(40)).is_ok());
        assert!(CheckpointHandle::parse("abc").is_err());
        assert!(CheckpointHandle::parse(&"a".repeat(64)).is_err());
        assert!(CheckpointHandle::parse(&"z".repeat(40)).is_err());
    }
}
