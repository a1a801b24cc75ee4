use std::collections::VecDeque;
use std::sync::Arc;

use marshal_tools::ToolCall;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::router::{self, CallContext};
use super::stepper::{ResolvedCall, RunStepper, StepperInput, StepperOutput, TurnRecord};
use super::turn::{TurnError, TurnRequest};
use super::{RunNotice, Runtime};
use crate::agents::{AgentDefinition, AgentRun, ControlSignal, FailureKind, RunOutcome, TerminalReason};
use crate::detectors::{EventKind, millis};

/// Async driver of a [`RunStepper`]. Carries out the stepper's effects and
/// feeds their results back in, one input at a time.
pub(crate) struct Interpreter<'a> {
    runtime: &'a Arc<Runtime>,
    definition: &'a AgentDefinition,
    cancel: &'a CancellationToken,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        runtime: &'a Arc<Runtime>,
        definition: &'a AgentDefinition,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            runtime,
            definition,
            cancel,
        }
    }

    pub(crate) async fn drive(self, run: AgentRun) -> RunOutcome {
        let stepper = RunStepper::new(Arc::clone(&self.definition.program));
        let mut inputs = VecDeque::from([StepperInput::Start]);
        let mut run = run;

        while let Some(input) = inputs.pop_front() {
            let (next, outputs) = stepper.step(run, input);
            run = next;

            for output in outputs {
                match output {
                    StepperOutput::Appended { entry } => self.runtime.notify(RunNotice::Appended {
                        run_id: run.id,
                        entry,
                    }),
                    StepperOutput::StatusChanged { status } => {
                        self.runtime.notify(RunNotice::StatusChanged {
                            run_id: run.id,
                            status,
                        });
                    }
                    StepperOutput::Finished { reason } => return RunOutcome::from_run(run, reason),
                    // Effects are always the last output of a step, so the
                    // run is suspended on exactly one of them here.
                    StepperOutput::ExecuteTool { call } => {
                        inputs.push_back(self.execute_directive(&run, call).await);
                    }
                    StepperOutput::RunTurn { signal } => {
                        inputs.push_back(self.run_turn(&run, signal).await);
                    }
                }
            }
        }

        warn!(target: "marshal::interpreter", run_id = %run.id, "run stalled without reaching a terminal state");
        let reason = run.terminal_reason().cloned().unwrap_or_else(|| {
            TerminalReason::failed(FailureKind::Internal, "run stalled without a terminal state")
        });
        RunOutcome::from_run(run, reason)
    }

    async fn execute_directive(&self, run: &AgentRun, call: ToolCall) -> StepperInput {
        let ctx = self.context(run);
        let routed = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return StepperInput::Cancel,
            routed = router::route(&ctx, &call) => routed,
        };
        StepperInput::ToolResolved(ResolvedCall {
            call,
            result: routed.result,
            checkpoints: routed.checkpoints,
        })
    }

    async fn run_turn(&self, run: &AgentRun, signal: ControlSignal) -> StepperInput {
        let request = TurnRequest {
            run_id: run.id,
            agent_type: run.agent_type.clone(),
            history: run.history.clone(),
            tools: self.definition.tools.iter().cloned().collect(),
            orchestration_schemas: router::orchestration_schemas(&self.definition.tools),
        };
        let limit = self.runtime.config.interpreter.turn_timeout();
        self.runtime.interaction(
            EventKind::ResponseStarted,
            json!({ "run_id": run.id, "signal": signal }),
        );

        let turn_cancel = self.cancel.child_token();
        let _turn_guard = turn_cancel.clone().drop_guard();
        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return StepperInput::Cancel,
            response = tokio::time::timeout(limit, self.runtime.engine.next_turn(request, turn_cancel)) => response,
        };

        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(TurnError::Cancelled)) => return StepperInput::Cancel,
            Ok(Err(TurnError::Model(message))) => {
                warn!(target: "marshal::interpreter", run_id = %run.id, %message, "model turn failed");
                return StepperInput::Fail {
                    kind: FailureKind::Model,
                    message,
                };
            }
            Err(_) => {
                warn!(target: "marshal::interpreter", run_id = %run.id, timeout_ms = millis(limit), "model turn timed out");
                return StepperInput::Fail {
                    kind: FailureKind::Timeout,
                    message: format!("turn did not finish within {}ms", millis(limit)),
                };
            }
        };
        debug!(
            target: "marshal::interpreter",
            run_id = %run.id,
            calls = response.tool_calls.len(),
            end_turn = response.end_turn,
            "model turn received"
        );

        // Calls proposed in one turn run in the order given.
        let ctx = self.context(run);
        let mut calls = Vec::with_capacity(response.tool_calls.len());
        for proposed in response.tool_calls {
            let call = ToolCall::new(proposed.name, proposed.input);
            let routed = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return StepperInput::Cancel,
                routed = router::route(&ctx, &call) => routed,
            };
            calls.push(ResolvedCall {
                call,
                result: routed.result,
                checkpoints: routed.checkpoints,
            });
        }

        self.runtime.interaction(
            EventKind::ResponseFinished,
            json!({ "run_id": run.id, "end_turn": response.end_turn }),
        );
        StepperInput::TurnCompleted(TurnRecord {
            text: response.text,
            calls,
            end_turn: response.end_turn,
        })
    }

    fn context<'r>(&'r self, run: &'r AgentRun) -> CallContext<'r> {
        CallContext {
            runtime: self.runtime,
            run,
            definition: self.definition,
            cancel: self.cancel,
        }
    }
}
