use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use marshal_tools::ToolCall;
use serde_json::Value;
use tracing::{debug, warn};

use super::CheckpointManager;
use crate::agents::SnapshotPhase;
use crate::config::CheckpointSection;
use crate::runtime::stepper::CheckpointStamp;

/// Which tool calls get a checkpoint around them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub tools: BTreeSet<String>,
    pub after_call: bool,
}

impl SnapshotPolicy {
    pub fn from_section(section: &CheckpointSection) -> Self {
        Self {
            tools: section.snapshot_tools.iter().cloned().collect(),
            after_call: section.snapshot_after,
        }
    }

    pub fn applies_to(&self, call: &ToolCall) -> bool {
        self.tools.contains(&call.name)
    }

    /// Paths named by the call's `path` and `paths` inputs.
    pub fn file_set(call: &ToolCall) -> Vec<String> {
        let mut paths = Vec::new();
        if let Some(path) = call.parameters.get("path").and_then(Value::as_str) {
            paths.push(path.to_string());
        }
        if let Some(list) = call.parameters.get("paths").and_then(Value::as_array) {
            paths.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
        }
        paths
    }
}

/// Snapshots the files a mutating tool call touches.
#[derive(Clone)]
pub struct CheckpointHook {
    pub manager: Arc<CheckpointManager>,
    pub policy: SnapshotPolicy,
    pub project_dir: PathBuf,
}

impl CheckpointHook {
    /// Failures are logged and yield no stamp; they never affect the call.
    pub(crate) async fn snapshot(
        &self,
        call: &ToolCall,
        phase: SnapshotPhase,
    ) -> Option<CheckpointStamp> {
        if !self.policy.applies_to(call) {
            return None;
        }
        if phase == SnapshotPhase::AfterCall && !self.policy.after_call {
            return None;
        }
        let file_set = SnapshotPolicy::file_set(call);
        if file_set.is_empty() {
            debug!(target: "marshal::checkpoint", tool = %call.name, "mutating call names no paths, nothing to snapshot");
            return None;
        }

        let label = match phase {
            SnapshotPhase::BeforeCall => format!("before {} ({})", call.name, call.id),
            SnapshotPhase::AfterCall => format!("after {} ({})", call.name, call.id),
        };
        match self
            .manager
            .store(&self.project_dir, &file_set, Some(&label))
            .await
        {
            Ok(handle) => Some(CheckpointStamp {
                phase,
                handle: handle.to_string(),
            }),
            Err(e) => {
                warn!(target: "marshal::checkpoint", tool = %call.name, error = %e, "snapshot failed");
                None
            }
        }
    }
}
