use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ToolSpec;

pub const RESEARCH_TOOL_NAME: &str = "research";

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResearchParams {
    /// One research question per child agent.
    pub prompts: Vec<String>,
}

/// One textual summary per prompt, in prompt order.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResearchOutput {
    pub summaries: Vec<String>,
}

pub struct ResearchToolSpec;

impl ToolSpec for ResearchToolSpec {
    type Params = ResearchParams;
    type Output = ResearchOutput;

    const NAME: &'static str = RESEARCH_TOOL_NAME;
    const DESCRIPTION: &'static str = "Investigate several questions in parallel with read-only research agents \
         and return one summary per question.";
}
