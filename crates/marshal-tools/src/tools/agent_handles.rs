use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ToolSpec;
use crate::tools::spawn_agents::ChildOutcome;

pub const CHECK_AGENT_TOOL_NAME: &str = "check_agent";
pub const AWAIT_AGENTS_TOOL_NAME: &str = "await_agents";

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CheckAgentParams {
    /// Run id returned by spawn_agents_async.
    pub run_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AwaitAgentsParams {
    /// Run ids returned by spawn_agents_async.
    pub run_ids: Vec<String>,
    /// Give up on runs still going after this many milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentHandleStatus {
    Running,
    Finished { outcome: ChildOutcome },
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AwaitedAgent {
    pub run_id: String,
    pub status: AgentHandleStatus,
}

pub struct CheckAgentToolSpec;

impl ToolSpec for CheckAgentToolSpec {
    type Params = CheckAgentParams;
    type Output = AwaitedAgent;

    const NAME: &'static str = CHECK_AGENT_TOOL_NAME;
    const DESCRIPTION: &'static str = "Report whether a background agent has finished, without waiting.";
}

pub struct AwaitAgentsToolSpec;

impl ToolSpec for AwaitAgentsToolSpec {
    type Params = AwaitAgentsParams;
    type Output = Vec<AwaitedAgent>;

    const NAME: &'static str = AWAIT_AGENTS_TOOL_NAME;
    const DESCRIPTION: &'static str = "Wait for background agents to finish and return their outcomes in the order given.";
}
