use std::sync::Arc;

use marshal_tools::{ToolCallId, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::run::RunHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    /// Let the model take exactly one turn.
    StepOne,
    /// Let the model keep taking turns until it ends its turn on its own.
    StepAll,
}

/// What a step program asks for when it suspends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum StepDirective {
    ToolCall { name: String, input: Value },
    Control { signal: ControlSignal },
}

impl StepDirective {
    pub fn tool(name: impl Into<String>, input: Value) -> Self {
        Self::ToolCall {
            name: name.into(),
            input,
        }
    }

    pub fn step() -> Self {
        Self::Control {
            signal: ControlSignal::StepOne,
        }
    }

    pub fn step_all() -> Self {
        Self::Control {
            signal: ControlSignal::StepAll,
        }
    }
}

/// Why the program is being resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resume", rename_all = "snake_case")]
pub enum Resume {
    Start,
    ToolResult {
        call_id: ToolCallId,
        tool_name: String,
        result: ToolResult,
    },
    StepComplete {
        end_turn: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgramStep {
    Yield(StepDirective),
    Return(Option<Value>),
}

/// Everything a program may look at when deciding its next directive.
#[derive(Debug, Clone, Copy)]
pub struct ProgramView<'a> {
    pub agent_type: &'a str,
    pub params: &'a Value,
    pub history: &'a RunHistory,
    /// Directives yielded so far.
    pub cursor: u32,
    pub resume: &'a Resume,
}

/// A declarative agent body.
///
/// Programs are pure: the next step is a function of the view alone, so a run
/// can be replayed from its history. Anything with an effect goes through a
/// yielded directive.
pub trait StepProgram: Send + Sync {
    fn resume(&self, view: &ProgramView<'_>) -> ProgramStep;
}

impl<F> StepProgram for F
where
    F: Fn(&ProgramView<'_>) -> ProgramStep + Send + Sync,
{
    fn resume(&self, view: &ProgramView<'_>) -> ProgramStep {
        self(view)
    }
}

pub fn program_fn<F>(f: F) -> Arc<dyn StepProgram>
where
    F: Fn(&ProgramView<'_>) -> ProgramStep + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Hands control to the model until it ends its turn, then returns the last
/// assistant message.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunToCompletion;

impl StepProgram for RunToCompletion {
    fn resume(&self, view: &ProgramView<'_>) -> ProgramStep {
        match view.resume {
            Resume::Start => ProgramStep::Yield(StepDirective::step_all()),
            _ => ProgramStep::Return(view.history.last_assistant_text().map(Value::from)),
        }
    }
}
