pub mod agent_handles;
pub mod research;
pub mod spawn_agents;

pub use agent_handles::{
    AWAIT_AGENTS_TOOL_NAME, AgentHandleStatus, AwaitAgentsParams, AwaitAgentsToolSpec,
    AwaitedAgent, CHECK_AGENT_TOOL_NAME, CheckAgentParams, CheckAgentToolSpec,
};
pub use research::{RESEARCH_TOOL_NAME, ResearchOutput, ResearchParams, ResearchToolSpec};
pub use spawn_agents::{
    AgentSpawnRequest, ChildOutcome, ChildReport, DetachedHandle, SPAWN_AGENTS_ASYNC_TOOL_NAME,
    SPAWN_AGENTS_TOOL_NAME, SpawnAgentsAsyncOutput, SpawnAgentsAsyncToolSpec, SpawnAgentsOutput,
    SpawnAgentsParams, SpawnAgentsToolSpec,
};

// Client-executed tools. Their behavior lives on the remote executor; only the
// names matter to the runtime.
pub const READ_FILES_TOOL_NAME: &str = "read_files";
pub const CODE_SEARCH_TOOL_NAME: &str = "code_search";
pub const FIND_FILES_TOOL_NAME: &str = "find_files";
pub const WRITE_FILE_TOOL_NAME: &str = "write_file";
pub const STR_REPLACE_TOOL_NAME: &str = "str_replace";
pub const RUN_TERMINAL_COMMAND_TOOL_NAME: &str = "run_terminal_command";

/// Tools that never mutate the project.
pub const READ_ONLY_TOOLS: &[&str] = &[
    READ_FILES_TOOL_NAME,
    CODE_SEARCH_TOOL_NAME,
    FIND_FILES_TOOL_NAME,
];

/// Tools answered by the runtime itself rather than the remote executor.
pub const ORCHESTRATION_TOOLS: &[&str] = &[
    SPAWN_AGENTS_TOOL_NAME,
    SPAWN_AGENTS_ASYNC_TOOL_NAME,
    RESEARCH_TOOL_NAME,
    CHECK_AGENT_TOOL_NAME,
    AWAIT_AGENTS_TOOL_NAME,
];

pub fn is_orchestration_tool(name: &str) -> bool {
    ORCHESTRATION_TOOLS.contains(&name)
}
