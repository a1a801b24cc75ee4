use std::collections::BTreeSet;
use std::sync::Arc;

use marshal_tools::tools::{
    AWAIT_AGENTS_TOOL_NAME, AwaitAgentsToolSpec, CHECK_AGENT_TOOL_NAME, CheckAgentToolSpec,
    RESEARCH_TOOL_NAME, ResearchToolSpec, SPAWN_AGENTS_ASYNC_TOOL_NAME, SPAWN_AGENTS_TOOL_NAME,
    SpawnAgentsAsyncToolSpec, SpawnAgentsToolSpec, is_orchestration_tool,
};
use marshal_tools::{ToolCall, ToolError, ToolResult, ToolSchema, ToolSpec};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Runtime;
use super::spawn;
use super::stepper::CheckpointStamp;
use crate::agents::{AgentDefinition, AgentRun, SnapshotPhase};
use crate::detectors::EventKind;

/// The run a tool call is made on behalf of.
pub(crate) struct CallContext<'a> {
    pub runtime: &'a Arc<Runtime>,
    pub run: &'a AgentRun,
    pub definition: &'a AgentDefinition,
    pub cancel: &'a CancellationToken,
}

pub(crate) struct Routed {
    pub result: ToolResult,
    pub checkpoints: Vec<CheckpointStamp>,
}

impl From<ToolResult> for Routed {
    fn from(result: ToolResult) -> Self {
        Self {
            result,
            checkpoints: Vec::new(),
        }
    }
}

/// Resolves one tool call: orchestration tools are answered in-process,
/// everything else goes through the tool call channel.
pub(crate) async fn route(ctx: &CallContext<'_>, call: &ToolCall) -> Routed {
    let runtime = ctx.runtime;
    runtime.interaction(
        EventKind::ToolCallStarted,
        json!({ "run_id": ctx.run.id, "call_id": call.id, "tool": call.name }),
    );

    let routed = if !ctx.definition.allows_tool(&call.name) {
        debug!(target: "marshal::interpreter", run_id = %ctx.run.id, tool = %call.name, "tool not permitted");
        Routed::from(ToolResult::Error(ToolError::NotPermitted {
            tool_name: call.name.clone(),
            agent_type: ctx.definition.agent_type.clone(),
        }))
    } else if is_orchestration_tool(&call.name) {
        Routed::from(orchestrate(ctx, call).await)
    } else {
        remote(ctx, call).await
    };

    runtime.interaction(
        EventKind::ToolCallFinished,
        json!({
            "run_id": ctx.run.id,
            "call_id": call.id,
            "tool": call.name,
            "error": routed.result.error().map(|e| e.kind().to_string()),
        }),
    );
    routed
}

async fn orchestrate(ctx: &CallContext<'_>, call: &ToolCall) -> ToolResult {
    match call.name.as_str() {
        SPAWN_AGENTS_TOOL_NAME => match call.params() {
            Ok(params) => respond(spawn::spawn_blocking(ctx, params).await),
            Err(e) => e.into(),
        },
        SPAWN_AGENTS_ASYNC_TOOL_NAME => match call.params() {
            Ok(params) => respond(spawn::spawn_detached(ctx, params)),
            Err(e) => e.into(),
        },
        RESEARCH_TOOL_NAME => match call.params() {
            Ok(params) => respond(spawn::research(ctx, params).await),
            Err(e) => e.into(),
        },
        CHECK_AGENT_TOOL_NAME => match call.params() {
            Ok(params) => respond(spawn::check_agent(ctx, params)),
            Err(e) => e.into(),
        },
        AWAIT_AGENTS_TOOL_NAME => match call.params() {
            Ok(params) => respond(spawn::await_agents(ctx, params).await),
            Err(e) => e.into(),
        },
        other => ToolError::UnknownTool {
            tool_name: other.to_string(),
        }
        .into(),
    }
}

fn respond<T: Serialize>(output: Result<T, ToolError>) -> ToolResult {
    match output {
        Ok(output) => ToolResult::from_output(&output),
        Err(e) => e.into(),
    }
}

async fn remote(ctx: &CallContext<'_>, call: &ToolCall) -> Routed {
    let hook = ctx.runtime.checkpoints.as_ref();
    let mut checkpoints = Vec::new();

    if let Some(hook) = hook {
        checkpoints.extend(hook.snapshot(call, SnapshotPhase::BeforeCall).await);
    }
    let result = ctx.runtime.channel.submit(ctx.run.id, call.clone()).await;
    if let Some(hook) = hook {
        if !result.is_error() {
            checkpoints.extend(hook.snapshot(call, SnapshotPhase::AfterCall).await);
        }
    }

    Routed {
        result,
        checkpoints,
    }
}

/// Schemas of the orchestration tools an agent may call.
pub(crate) fn orchestration_schemas(tools: &BTreeSet<String>) -> Vec<ToolSchema> {
    [
        SpawnAgentsToolSpec::schema(),
        SpawnAgentsAsyncToolSpec::schema(),
        ResearchToolSpec::schema(),
        CheckAgentToolSpec::schema(),
        AwaitAgentsToolSpec::schema(),
    ]
    .into_iter()
    .filter(|schema| tools.contains(&schema.name))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schemas_follow_the_agent_tool_set() {
        let tools: BTreeSet<String> = ["read_files", "spawn_agents", "await_agents"]
            .into_iter()
            .map(str::to_string)
            .collect();
        let names: Vec<String> = orchestration_schemas(&tools)
            .into_iter()
            .map(|schema| schema.name)
            .collect();
        assert_eq!(names, vec!["spawn_agents".to_string(), "await_agents".to_string()]);
    }
}
