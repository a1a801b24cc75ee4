use chrono::{DateTime, Utc};
use marshal_tools::tools::ChildOutcome;
use marshal_tools::{RunId, ToolCall, ToolCallId, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use super::program::ControlSignal;
use crate::runtime::stepper::InterpreterState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingTool,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Timeout,
    Decoding,
    Model,
    Spawn,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminalReason {
    Completed {
        #[serde(default)]
        output: Option<Value>,
    },
    /// Forced stop; the program did not get to finish.
    BudgetExhausted,
    Failed {
        kind: FailureKind,
        message: String,
    },
    Cancelled,
}

impl TerminalReason {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    /// Budget exhaustion is a stop, not a failure, so it reports `completed`.
    pub fn status(&self) -> RunStatus {
        match self {
            TerminalReason::Completed { .. } | TerminalReason::BudgetExhausted => {
                RunStatus::Completed
            }
            TerminalReason::Failed { .. } => RunStatus::Failed,
            TerminalReason::Cancelled => RunStatus::Cancelled,
        }
    }
}

impl From<&TerminalReason> for ChildOutcome {
    fn from(reason: &TerminalReason) -> Self {
        match reason {
            TerminalReason::Completed { output } => ChildOutcome::Completed {
                output: output.clone(),
            },
            TerminalReason::BudgetExhausted => ChildOutcome::BudgetExhausted,
            TerminalReason::Failed { kind, message } => ChildOutcome::Failed {
                kind: kind.to_string(),
                message: message.clone(),
            },
            TerminalReason::Cancelled => ChildOutcome::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOrigin {
    Program,
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    BeforeCall,
    AfterCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    UserPrompt {
        text: String,
    },
    AssistantTurn {
        text: String,
        end_turn: bool,
    },
    ToolCallIssued {
        call: ToolCall,
        origin: CallOrigin,
    },
    ToolCallResolved {
        call_id: ToolCallId,
        tool_name: String,
        result: ToolResult,
    },
    StepCompleted {
        signal: ControlSignal,
        end_turn: bool,
    },
    CheckpointStored {
        call_id: ToolCallId,
        handle: String,
        phase: SnapshotPhase,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: RunEvent,
}

/// Append-only record of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    entries: Vec<HistoryEntry>,
}

impl RunHistory {
    /// Starts a child history from a copy of the parent's events.
    pub fn inherited_from(parent: &RunHistory) -> Self {
        let mut history = Self::default();
        for entry in &parent.entries {
            history.append(entry.event.clone());
        }
        history
    }

    pub fn append(&mut self, event: RunEvent) -> &HistoryEntry {
        let seq = self.entries.len() as u64;
        self.entries.push(HistoryEntry {
            seq,
            recorded_at: Utc::now(),
            event,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn events(&self) -> impl Iterator<Item = &RunEvent> {
        self.entries.iter().map(|entry| &entry.event)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_assistant_text(&self) -> Option<String> {
        self.entries.iter().rev().find_map(|entry| match &entry.event {
            RunEvent::AssistantTurn { text, .. } if !text.is_empty() => Some(text.clone()),
            _ => None,
        })
    }

    /// Latest result for the given call, if it has resolved.
    pub fn result_of(&self, call_id: &ToolCallId) -> Option<&ToolResult> {
        self.entries.iter().rev().find_map(|entry| match &entry.event {
            RunEvent::ToolCallResolved {
                call_id: resolved,
                result,
                ..
            } if resolved == call_id => Some(result),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBudget {
    initial: u32,
    remaining: u32,
}

impl StepBudget {
    pub fn new(turns: u32) -> Self {
        Self {
            initial: turns,
            remaining: turns,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn used(&self) -> u32 {
        self.initial.saturating_sub(self.remaining)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Spends one turn. Never goes below zero.
    pub fn consume(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }
}

/// One execution of an agent definition, as plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: RunId,
    pub parent_id: Option<RunId>,
    pub agent_type: String,
    pub depth: u32,
    pub params: Value,
    pub budget: StepBudget,
    pub history: RunHistory,
    pub status: RunStatus,
    pub state: InterpreterState,
    /// Directives yielded by the program so far.
    pub cursor: u32,
    /// Times the program was resumed with the outcome of a directive.
    pub resumptions: u32,
}

impl AgentRun {
    pub fn new(
        id: RunId,
        parent_id: Option<RunId>,
        agent_type: impl Into<String>,
        depth: u32,
        params: Value,
        budget: u32,
        history: RunHistory,
    ) -> Self {
        Self {
            id,
            parent_id,
            agent_type: agent_type.into(),
            depth,
            params,
            budget: StepBudget::new(budget),
            history,
            status: RunStatus::Pending,
            state: InterpreterState::Ready,
            cursor: 0,
            resumptions: 0,
        }
    }

    pub fn terminal_reason(&self) -> Option<&TerminalReason> {
        match &self.state {
            InterpreterState::Terminal { reason } => Some(reason),
            _ => None,
        }
    }
}

/// What the creator of a run gets back once it is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub parent_id: Option<RunId>,
    pub agent_type: String,
    pub reason: TerminalReason,
    pub turns_used: u32,
    pub history: RunHistory,
}

impl RunOutcome {
    pub fn from_run(run: AgentRun, reason: TerminalReason) -> Self {
        Self {
            run_id: run.id,
            parent_id: run.parent_id,
            agent_type: run.agent_type,
            turns_used: run.budget.used(),
            history: run.history,
            reason,
        }
    }

    /// Outcome for a run that never started.
    pub fn rejected(
        run_id: RunId,
        parent_id: Option<RunId>,
        agent_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            parent_id,
            agent_type: agent_type.into(),
            reason: TerminalReason::failed(FailureKind::Spawn, message),
            turns_used: 0,
            history: RunHistory::default(),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.reason.status()
    }

    pub fn output(&self) -> Option<&Value> {
        match &self.reason {
            TerminalReason::Completed { output } => output.as_ref(),
            _ => None,
        }
    }

    pub fn child_outcome(&self) -> ChildOutcome {
        ChildOutcome::from(&self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TerminalReason::Completed { output: None }, RunStatus::Completed)]
    #[case(TerminalReason::BudgetExhausted, RunStatus::Completed)]
    #[case(TerminalReason::failed(FailureKind::Timeout, "slow"), RunStatus::Failed)]
    #[case(TerminalReason::Cancelled, RunStatus::Cancelled)]
    fn terminal_reasons_map_to_status(#[case] reason: TerminalReason, #[case] status: RunStatus) {
        assert_eq!(reason.status(), status);
        assert!(status.is_terminal());
    }

    #[test]
    fn budget_exhaustion_is_distinct_from_completion() {
        assert_eq!(
            ChildOutcome::from(&TerminalReason::BudgetExhausted),
            ChildOutcome::BudgetExhausted
        );
        assert_ne!(
            TerminalReason::BudgetExhausted,
            TerminalReason::Completed { output: None }
        );
    }

    #[test]
    fn history_is_sequenced_and_inheritable() {
        let mut parent = RunHistory::default();
        parent.append(RunEvent::UserPrompt {
            text: "find the bug".to_string(),
        });
        parent.append(RunEvent::AssistantTurn {
            text: "looking".to_string(),
            end_turn: false,
        });

        let mut child = RunHistory::inherited_from(&parent);
        child.append(RunEvent::UserPrompt {
            text: "check parser.rs".to_string(),
        });

        let seqs: Vec<u64> = child.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(parent.len(), 2);
        assert_eq!(child.last_assistant_text().as_deref(), Some("looking"));
    }

    #[test]
    fn budget_never_underflows() {
        let mut budget = StepBudget::new(1);
        budget.consume();
        budget.consume();
        assert!(budget.is_exhausted());
        assert_eq!(budget.used(), 1);
    }

    #[test]
    fn inconsistent_stored_budget_reports_nothing_used() {
        let budget: StepBudget =
            serde_json::from_value(serde_json::json!({ "initial": 2, "remaining": 5 })).unwrap();
        assert_eq!(budget.used(), 0);
        assert_eq!(budget.remaining(), 5);
    }

    #[test]
    fn run_round_trips_through_json() {
        let mut history = RunHistory::default();
        history.append(RunEvent::UserPrompt {
            text: "hi".to_string(),
        });
        let run = AgentRun::new(RunId::new(), None, "base", 0, Value::Null, 3, history);

        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["state"]["state"], "ready");
        let back: AgentRun = serde_json::from_value(json).unwrap();
        assert_eq!(back, run);
    }
}
