use std::sync::Arc;

use marshal_tools::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agents::{
    AgentRun, CallOrigin, ControlSignal, FailureKind, HistoryEntry, ProgramStep, ProgramView,
    Resume, RunEvent, RunStatus, SnapshotPhase, StepDirective, StepProgram, TerminalReason,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InterpreterState {
    Ready,
    AwaitingDirectiveResult {
        call: ToolCall,
    },
    StepBoundary {
        signal: ControlSignal,
        /// Turns already taken under this signal.
        turns: u32,
    },
    Terminal {
        reason: TerminalReason,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStamp {
    pub phase: SnapshotPhase,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCall {
    pub call: ToolCall,
    pub result: ToolResult,
    pub checkpoints: Vec<CheckpointStamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub text: String,
    pub calls: Vec<ResolvedCall>,
    pub end_turn: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepperInput {
    Start,
    ToolResolved(ResolvedCall),
    TurnCompleted(TurnRecord),
    Cancel,
    Fail { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepperOutput {
    ExecuteTool { call: ToolCall },
    RunTurn { signal: ControlSignal },
    Appended { entry: HistoryEntry },
    StatusChanged { status: RunStatus },
    Finished { reason: TerminalReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeMode {
    Normal,
    /// The budget is spent; the program may only return.
    Final,
}

/// Pure transition function of one run. All effects are described by the
/// returned outputs and carried out by the caller.
pub struct RunStepper {
    program: Arc<dyn StepProgram>,
}

impl RunStepper {
    pub fn new(program: Arc<dyn StepProgram>) -> Self {
        Self { program }
    }

    pub fn step(&self, mut run: AgentRun, input: StepperInput) -> (AgentRun, Vec<StepperOutput>) {
        let mut outputs = Vec::new();
        let state = std::mem::replace(&mut run.state, InterpreterState::Ready);

        match (state, input) {
            (state @ InterpreterState::Terminal { .. }, input) => {
                debug!(target: "marshal::interpreter", run_id = %run.id, ?input, "input after terminal state ignored");
                run.state = state;
            }
            (_, StepperInput::Cancel) => {
                Self::finish(&mut run, TerminalReason::Cancelled, &mut outputs);
            }
            (_, StepperInput::Fail { kind, message }) => {
                Self::finish(&mut run, TerminalReason::Failed { kind, message }, &mut outputs);
            }
            (InterpreterState::Ready, StepperInput::Start) if run.cursor == 0 => {
                Self::set_status(&mut run, RunStatus::Running, &mut outputs);
                if run.budget.is_exhausted() {
                    Self::finish(&mut run, TerminalReason::BudgetExhausted, &mut outputs);
                } else {
                    self.resume_program(&mut run, Resume::Start, ResumeMode::Normal, &mut outputs);
                }
            }
            (
                InterpreterState::AwaitingDirectiveResult { call },
                StepperInput::ToolResolved(resolved),
            ) if resolved.call.id == call.id => {
                let ResolvedCall {
                    call,
                    result,
                    checkpoints,
                } = resolved;
                Self::record_resolution(&mut run, &call, result.clone(), checkpoints, &mut outputs);
                run.resumptions += 1;
                Self::set_status(&mut run, RunStatus::Running, &mut outputs);
                self.resume_program(
                    &mut run,
                    Resume::ToolResult {
                        call_id: call.id,
                        tool_name: call.name,
                        result,
                    },
                    ResumeMode::Normal,
                    &mut outputs,
                );
            }
            (InterpreterState::StepBoundary { signal, turns }, StepperInput::TurnCompleted(turn)) => {
                let end_turn = turn.end_turn;
                Self::record_turn(&mut run, turn, &mut outputs);
                run.budget.consume();

                if run.budget.is_exhausted() && !end_turn {
                    debug!(target: "marshal::interpreter", run_id = %run.id, "step budget exhausted mid-reasoning");
                    Self::finish(&mut run, TerminalReason::BudgetExhausted, &mut outputs);
                } else if run.budget.is_exhausted() || signal == ControlSignal::StepOne || end_turn {
                    let mode = if run.budget.is_exhausted() {
                        ResumeMode::Final
                    } else {
                        ResumeMode::Normal
                    };
                    Self::append(
                        &mut run,
                        RunEvent::StepCompleted { signal, end_turn },
                        &mut outputs,
                    );
                    run.resumptions += 1;
                    self.resume_program(&mut run, Resume::StepComplete { end_turn }, mode, &mut outputs);
                } else {
                    run.state = InterpreterState::StepBoundary {
                        signal,
                        turns: turns + 1,
                    };
                    outputs.push(StepperOutput::RunTurn { signal });
                }
            }
            (state, input) => {
                debug!(target: "marshal::interpreter", run_id = %run.id, ?state, ?input, "input does not match state, ignored");
                run.state = state;
            }
        }

        (run, outputs)
    }

    fn resume_program(
        &self,
        run: &mut AgentRun,
        resume: Resume,
        mode: ResumeMode,
        outputs: &mut Vec<StepperOutput>,
    ) {
        let step = {
            let view = ProgramView {
                agent_type: &run.agent_type,
                params: &run.params,
                history: &run.history,
                cursor: run.cursor,
                resume: &resume,
            };
            self.program.resume(&view)
        };

        match step {
            ProgramStep::Return(output) => {
                Self::finish(run, TerminalReason::Completed { output }, outputs);
            }
            ProgramStep::Yield(_) if mode == ResumeMode::Final => {
                Self::finish(run, TerminalReason::BudgetExhausted, outputs);
            }
            ProgramStep::Yield(StepDirective::Control { signal }) => {
                if run.budget.is_exhausted() {
                    Self::finish(run, TerminalReason::BudgetExhausted, outputs);
                    return;
                }
                run.cursor += 1;
                Self::set_status(run, RunStatus::Running, outputs);
                run.state = InterpreterState::StepBoundary { signal, turns: 0 };
                outputs.push(StepperOutput::RunTurn { signal });
            }
            ProgramStep::Yield(StepDirective::ToolCall { name, input }) => {
                run.cursor += 1;
                let call = ToolCall::new(name, input);
                Self::append(
                    run,
                    RunEvent::ToolCallIssued {
                        call: call.clone(),
                        origin: CallOrigin::Program,
                    },
                    outputs,
                );
                Self::set_status(run, RunStatus::AwaitingTool, outputs);
                run.state = InterpreterState::AwaitingDirectiveResult { call: call.clone() };
                outputs.push(StepperOutput::ExecuteTool { call });
            }
        }
    }

    fn record_turn(run: &mut AgentRun, turn: TurnRecord, outputs: &mut Vec<StepperOutput>) {
        Self::append(
            run,
            RunEvent::AssistantTurn {
                text: turn.text,
                end_turn: turn.end_turn,
            },
            outputs,
        );
        for resolved in turn.calls {
            Self::append(
                run,
                RunEvent::ToolCallIssued {
                    call: resolved.call.clone(),
                    origin: CallOrigin::Model,
                },
                outputs,
            );
            Self::record_resolution(run, &resolved.call, resolved.result, resolved.checkpoints, outputs);
        }
    }

    fn record_resolution(
        run: &mut AgentRun,
        call: &ToolCall,
        result: ToolResult,
        checkpoints: Vec<CheckpointStamp>,
        outputs: &mut Vec<StepperOutput>,
    ) {
        for stamp in checkpoints {
            Self::append(
                run,
                RunEvent::CheckpointStored {
                    call_id: call.id.clone(),
                    handle: stamp.handle,
                    phase: stamp.phase,
                },
                outputs,
            );
        }
        Self::append(
            run,
            RunEvent::ToolCallResolved {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                result,
            },
            outputs,
        );
    }

    fn append(run: &mut AgentRun, event: RunEvent, outputs: &mut Vec<StepperOutput>) {
        let entry = run.history.append(event).clone();
        outputs.push(StepperOutput::Appended { entry });
    }

    fn set_status(run: &mut AgentRun, status: RunStatus, outputs: &mut Vec<StepperOutput>) {
        if run.status != status {
            run.status = status;
            outputs.push(StepperOutput::StatusChanged { status });
        }
    }

    fn finish(run: &mut AgentRun, reason: TerminalReason, outputs: &mut Vec<StepperOutput>) {
        Self::set_status(run, reason.status(), outputs);
        run.state = InterpreterState::Terminal {
            reason: reason.clone(),
        };
        outputs.push(StepperOutput::Finished { reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{RunHistory, program_fn};
    use marshal_tools::{RunId, ToolError};
    use proptest::prelude::*;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn new_run(budget: u32) -> AgentRun {
        AgentRun::new(RunId::new(), None, "base", 0, json!({}), budget, RunHistory::default())
    }

    fn issued_call(outputs: &[StepperOutput]) -> Option<ToolCall> {
        outputs.iter().find_map(|output| match output {
            StepperOutput::ExecuteTool { call } => Some(call.clone()),
            _ => None,
        })
    }

    fn finished(outputs: &[StepperOutput]) -> Option<TerminalReason> {
        outputs.iter().find_map(|output| match output {
            StepperOutput::Finished { reason } => Some(reason.clone()),
            _ => None,
        })
    }

    fn requests_turn(outputs: &[StepperOutput]) -> bool {
        outputs
            .iter()
            .any(|output| matches!(output, StepperOutput::RunTurn { .. }))
    }

    fn resolved(call: &ToolCall, result: ToolResult) -> StepperInput {
        StepperInput::ToolResolved(ResolvedCall {
            call: call.clone(),
            result,
            checkpoints: Vec::new(),
        })
    }

    fn turn(text: &str, end_turn: bool) -> StepperInput {
        StepperInput::TurnCompleted(TurnRecord {
            text: text.to_string(),
            calls: Vec::new(),
            end_turn,
        })
    }

    /// Reads one file, then returns what it got.
    fn read_then_return() -> Arc<dyn StepProgram> {
        program_fn(|view| match view.resume {
            Resume::Start => {
                ProgramStep::Yield(StepDirective::tool("read_files", json!({"paths": ["a.rs"]})))
            }
            Resume::ToolResult { result, .. } => ProgramStep::Return(result.output().cloned()),
            Resume::StepComplete { .. } => ProgramStep::Return(None),
        })
    }

    #[test]
    fn tool_directive_suspends_until_its_result_arrives() {
        let stepper = RunStepper::new(read_then_return());

        let (run, outputs) = stepper.step(new_run(5), StepperInput::Start);
        let call = issued_call(&outputs).unwrap();
        assert_eq!(run.status, RunStatus::AwaitingTool);
        assert!(matches!(
            run.state,
            InterpreterState::AwaitingDirectiveResult { .. }
        ));

        let (run, outputs) = stepper.step(run, resolved(&call, ToolResult::Output(json!("fn main"))));
        assert_eq!(
            finished(&outputs),
            Some(TerminalReason::Completed {
                output: Some(json!("fn main"))
            })
        );
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.history.result_of(&call.id), Some(&ToolResult::Output(json!("fn main"))));
    }

    #[test]
    fn mismatched_and_duplicate_results_are_ignored() {
        let resumes = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&resumes);
        let program = program_fn(move |view| {
            counter.fetch_add(1, Ordering::SeqCst);
            if view.cursor < 2 {
                ProgramStep::Yield(StepDirective::tool("find_files", json!({})))
            } else {
                ProgramStep::Return(None)
            }
        });
        let stepper = RunStepper::new(program);

        let (run, outputs) = stepper.step(new_run(5), StepperInput::Start);
        let first = issued_call(&outputs).unwrap();

        let stranger = ToolCall::new("find_files", json!({}));
        let (run, outputs) = stepper.step(run, resolved(&stranger, ToolResult::Output(Value::Null)));
        assert!(outputs.is_empty());

        let (run, outputs) = stepper.step(run, resolved(&first, ToolResult::Output(Value::Null)));
        let second = issued_call(&outputs).unwrap();

        let (run, outputs) = stepper.step(run, resolved(&first, ToolResult::Output(Value::Null)));
        assert!(outputs.is_empty());
        assert_eq!(run.resumptions, 1);
        assert_eq!(resumes.load(Ordering::SeqCst), 2);

        let (run, _) = stepper.step(run, resolved(&second, ToolResult::Output(Value::Null)));
        assert_eq!(run.resumptions, 2);
        assert_eq!(run.cursor, 2);
        assert!(run.status.is_terminal());
    }

    #[test]
    fn budget_of_three_stops_after_the_third_turn() {
        let stepper = RunStepper::new(program_fn(|_| ProgramStep::Yield(StepDirective::step())));
        let (mut run, mut outputs) = stepper.step(new_run(3), StepperInput::Start);
        let mut turns = 0;

        while requests_turn(&outputs) {
            turns += 1;
            (run, outputs) = stepper.step(run, turn("still thinking", false));
        }

        assert_eq!(turns, 3);
        assert_eq!(finished(&outputs), Some(TerminalReason::BudgetExhausted));
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.budget.remaining(), 0);

        let (run, outputs) = stepper.step(run, turn("a fourth", false));
        assert!(outputs.is_empty());
        assert_eq!(run.budget.used(), 3);
    }

    #[test]
    fn step_all_keeps_turning_until_the_model_ends_its_turn() {
        let stepper = RunStepper::new(Arc::new(crate::agents::RunToCompletion));
        let (run, outputs) = stepper.step(new_run(10), StepperInput::Start);
        assert!(requests_turn(&outputs));

        let (run, outputs) = stepper.step(run, turn("looking", false));
        assert!(requests_turn(&outputs));
        assert!(matches!(
            run.state,
            InterpreterState::StepBoundary { turns: 1, .. }
        ));

        let (run, outputs) = stepper.step(run, turn("found it", true));
        assert_eq!(
            finished(&outputs),
            Some(TerminalReason::Completed {
                output: Some(json!("found it"))
            })
        );
        assert_eq!(run.budget.used(), 2);
        assert_eq!(run.resumptions, 1);
    }

    #[test]
    fn ending_the_turn_on_the_last_budgeted_step_may_still_complete() {
        let stepper = RunStepper::new(Arc::new(crate::agents::RunToCompletion));
        let (run, _) = stepper.step(new_run(1), StepperInput::Start);

        let (run, outputs) = stepper.step(run, turn("all done", true));

        assert_eq!(
            finished(&outputs),
            Some(TerminalReason::Completed {
                output: Some(json!("all done"))
            })
        );
        assert_eq!(run.budget.remaining(), 0);
    }

    #[test]
    fn program_asking_for_more_after_the_last_turn_is_exhausted() {
        let stepper = RunStepper::new(program_fn(|_| ProgramStep::Yield(StepDirective::step())));
        let (run, _) = stepper.step(new_run(1), StepperInput::Start);

        let (_, outputs) = stepper.step(run, turn("done", true));

        assert_eq!(finished(&outputs), Some(TerminalReason::BudgetExhausted));
    }

    #[test]
    fn zero_budget_terminates_without_running_the_program() {
        let stepper = RunStepper::new(program_fn(|_| ProgramStep::Yield(StepDirective::step())));
        let (run, outputs) = stepper.step(new_run(0), StepperInput::Start);

        assert_eq!(finished(&outputs), Some(TerminalReason::BudgetExhausted));
        assert_eq!(run.cursor, 0);
    }

    #[test]
    fn cancel_and_fail_are_terminal_from_any_live_state() {
        let stepper = RunStepper::new(read_then_return());

        let (run, _) = stepper.step(new_run(5), StepperInput::Start);
        let (run, outputs) = stepper.step(run, StepperInput::Cancel);
        assert_eq!(finished(&outputs), Some(TerminalReason::Cancelled));
        assert_eq!(run.status, RunStatus::Cancelled);

        let (run, _) = stepper.step(new_run(5), StepperInput::Start);
        let (run, outputs) = stepper.step(
            run,
            StepperInput::Fail {
                kind: FailureKind::Model,
                message: "provider down".to_string(),
            },
        );
        assert_eq!(
            finished(&outputs),
            Some(TerminalReason::failed(FailureKind::Model, "provider down"))
        );
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn error_results_are_handed_to_the_program() {
        let stepper = RunStepper::new(program_fn(|view| match view.resume {
            Resume::Start => ProgramStep::Yield(StepDirective::tool("read_files", json!({}))),
            Resume::ToolResult { result, .. } => {
                ProgramStep::Return(Some(json!({ "failed": result.is_error() })))
            }
            Resume::StepComplete { .. } => ProgramStep::Return(None),
        }));
        let (run, outputs) = stepper.step(new_run(5), StepperInput::Start);
        let call = issued_call(&outputs).unwrap();

        let (_, outputs) = stepper.step(
            run,
            resolved(&call, ToolResult::Error(ToolError::transport("read_files", "gone"))),
        );

        assert_eq!(
            finished(&outputs),
            Some(TerminalReason::Completed {
                output: Some(json!({"failed": true}))
            })
        );
    }

    #[test]
    fn suspended_run_survives_serialization() {
        let stepper = RunStepper::new(read_then_return());
        let (run, outputs) = stepper.step(new_run(5), StepperInput::Start);
        let call = issued_call(&outputs).unwrap();

        let stored = serde_json::to_string(&run).unwrap();
        let restored: AgentRun = serde_json::from_str(&stored).unwrap();
        assert_eq!(restored, run);

        let result = ToolResult::Output(json!("body"));
        let (left, left_outputs) = stepper.step(run, resolved(&call, result.clone()));
        let (right, right_outputs) = stepper.step(restored, resolved(&call, result));
        assert_eq!(finished(&left_outputs), finished(&right_outputs));
        assert_eq!(left.status, right.status);
    }

    #[derive(Debug, Clone)]
    enum Planned {
        Tool,
        StepOne,
        StepAll,
    }

    fn planned() -> impl Strategy<Value = Planned> {
        prop_oneof![
            Just(Planned::Tool),
            Just(Planned::StepOne),
            Just(Planned::StepAll)
        ]
    }

    proptest! {
        #[test]
        fn every_resumption_matches_one_delivered_result(
            plan in prop::collection::vec(planned(), 0..12),
            end_turns in prop::collection::vec(any::<bool>(), 1..40),
            duplicate in any::<bool>(),
            budget in 1u32..8,
        ) {
            let invocations = Arc::new(AtomicU32::new(0));
            let counter = Arc::clone(&invocations);
            let program = program_fn(move |view| {
                counter.fetch_add(1, Ordering::SeqCst);
                match plan.get(view.cursor as usize) {
                    Some(Planned::Tool) => ProgramStep::Yield(StepDirective::tool("code_search", json!({}))),
                    Some(Planned::StepOne) => ProgramStep::Yield(StepDirective::step()),
                    Some(Planned::StepAll) => ProgramStep::Yield(StepDirective::step_all()),
                    None => ProgramStep::Return(None),
                }
            });
            let stepper = RunStepper::new(program);
            let (mut run, mut outputs) = stepper.step(new_run(budget), StepperInput::Start);
            let mut turn_index = 0usize;

            while finished(&outputs).is_none() {
                let input = if let Some(call) = issued_call(&outputs) {
                    if duplicate {
                        let (next, extra) = stepper.step(run, resolved(&call, ToolResult::Output(Value::Null)));
                        run = next;
                        outputs = extra;
                        if finished(&outputs).is_some() { break; }
                        // The same delivery again must change nothing.
                        let before = run.resumptions;
                        let (next, again) = stepper.step(run, resolved(&call, ToolResult::Output(Value::Null)));
                        prop_assert!(again.is_empty());
                        prop_assert_eq!(next.resumptions, before);
                        run = next;
                        continue;
                    }
                    resolved(&call, ToolResult::Output(Value::Null))
                } else {
                    prop_assert!(requests_turn(&outputs));
                    let end_turn = end_turns[turn_index % end_turns.len()];
                    turn_index += 1;
                    turn("", end_turn)
                };
                let (next, next_outputs) = stepper.step(run, input);
                run = next;
                outputs = next_outputs;

                let outstanding = run.cursor - run.resumptions;
                prop_assert!(outstanding <= 1);
                prop_assert_eq!(invocations.load(Ordering::SeqCst), run.resumptions + 1);
            }

            prop_assert!(run.status.is_terminal());
            prop_assert!(run.budget.used() <= budget);
        }
    }
}
