use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ToolSpec;
use crate::ids::RunId;

pub const SPAWN_AGENTS_TOOL_NAME: &str = "spawn_agents";
pub const SPAWN_AGENTS_ASYNC_TOOL_NAME: &str = "spawn_agents_async";

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AgentSpawnRequest {
    /// Agent type to start, e.g. `file_picker`.
    pub agent_type: String,
    /// Instructions for the child agent.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Structured parameters handed to the child's step program.
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SpawnAgentsParams {
    /// Children to start. They run concurrently.
    pub agents: Vec<AgentSpawnRequest>,
}

/// How a child run ended, as reported back to the parent.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildOutcome {
    Completed {
        #[serde(default)]
        output: Option<Value>,
    },
    BudgetExhausted,
    Failed {
        kind: String,
        message: String,
    },
    Cancelled,
}

impl ChildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChildOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ChildReport {
    pub agent_type: String,
    /// Absent when the child could not be started at all.
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub run_id: Option<RunId>,
    pub outcome: ChildOutcome,
}

/// One slot per requested child, in request order.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SpawnAgentsOutput {
    pub results: Vec<ChildReport>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetachedHandle {
    Started {
        agent_type: String,
        #[schemars(with = "String")]
        run_id: RunId,
    },
    Rejected {
        agent_type: String,
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SpawnAgentsAsyncOutput {
    pub handles: Vec<DetachedHandle>,
}

pub struct SpawnAgentsToolSpec;

impl ToolSpec for SpawnAgentsToolSpec {
    type Params = SpawnAgentsParams;
    type Output = SpawnAgentsOutput;

    const NAME: &'static str = SPAWN_AGENTS_TOOL_NAME;
    const DESCRIPTION: &'static str =
        "Start child agents and wait for all of them to finish. Results come back in request order.";
}

pub struct SpawnAgentsAsyncToolSpec;

impl ToolSpec for SpawnAgentsAsyncToolSpec {
    type Params = SpawnAgentsParams;
    type Output = SpawnAgentsAsyncOutput;

    const NAME: &'static str = SPAWN_AGENTS_ASYNC_TOOL_NAME;
    const DESCRIPTION: &'static str = "Start child agents in the background and return their run ids immediately. \
         Use check_agent or await_agents to collect their results later.";
}
