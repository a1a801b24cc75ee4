use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use super::program::{RunToCompletion, StepProgram};

#[derive(Clone)]
pub struct AgentDefinition {
    pub agent_type: String,
    /// Tools this agent may call, orchestration tools included.
    pub tools: BTreeSet<String>,
    pub spawnable_agents: BTreeSet<String>,
    /// Falls back to the runtime default when unset.
    pub step_budget: Option<u32>,
    pub inherit_history: bool,
    pub program: Arc<dyn StepProgram>,
}

impl fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("agent_type", &self.agent_type)
            .field("tools", &self.tools)
            .field("spawnable_agents", &self.spawnable_agents)
            .field("step_budget", &self.step_budget)
            .field("inherit_history", &self.inherit_history)
            .finish_non_exhaustive()
    }
}

impl AgentDefinition {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            tools: BTreeSet::new(),
            spawnable_agents: BTreeSet::new(),
            step_budget: None,
            inherit_history: false,
            program: Arc::new(RunToCompletion),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_spawnable<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spawnable_agents
            .extend(agents.into_iter().map(Into::into));
        self
    }

    pub fn with_step_budget(mut self, turns: u32) -> Self {
        self.step_budget = Some(turns);
        self
    }

    pub fn inheriting_history(mut self) -> Self {
        self.inherit_history = true;
        self
    }

    pub fn with_program(mut self, program: Arc<dyn StepProgram>) -> Self {
        self.program = program;
        self
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.tools.contains(name)
    }

    pub fn can_spawn(&self, agent_type: &str) -> bool {
        self.spawnable_agents.contains(agent_type)
    }

    /// Keeps only the tools that also appear in `allowed`.
    pub fn restrict_tools<'a>(&mut self, allowed: impl IntoIterator<Item = &'a String>) {
        let allowed: BTreeSet<&String> = allowed.into_iter().collect();
        self.tools.retain(|tool| allowed.contains(tool));
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentCatalog {
    definitions: HashMap<String, AgentDefinition>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing definition of the same type.
    pub fn register(&mut self, definition: AgentDefinition) {
        self.definitions
            .insert(definition.agent_type.clone(), definition);
    }

    pub fn with(mut self, definition: AgentDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, agent_type: &str) -> Option<&AgentDefinition> {
        self.definitions.get(agent_type)
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.definitions.contains_key(agent_type)
    }

    pub fn agent_types(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_tools::tools::{READ_FILES_TOOL_NAME, WRITE_FILE_TOOL_NAME};

    #[test]
    fn restricting_tools_keeps_the_intersection() {
        let mut definition = AgentDefinition::new("editor")
            .with_tools([READ_FILES_TOOL_NAME, WRITE_FILE_TOOL_NAME]);
        let read_only = vec![READ_FILES_TOOL_NAME.to_string(), "code_search".to_string()];

        definition.restrict_tools(&read_only);

        assert!(definition.allows_tool(READ_FILES_TOOL_NAME));
        assert!(!definition.allows_tool(WRITE_FILE_TOOL_NAME));
        assert!(!definition.allows_tool("code_search"));
    }

    #[test]
    fn catalog_replaces_by_agent_type() {
        let catalog = AgentCatalog::new()
            .with(AgentDefinition::new("planner").with_step_budget(4))
            .with(AgentDefinition::new("planner").with_step_budget(9));

        assert_eq!(catalog.get("planner").and_then(|d| d.step_budget), Some(9));
        assert!(!catalog.contains("reviewer"));
    }
}
