//! Running agents: the pure stepper, its async driver, tool routing, spawning
//! and the session that owns it all.

mod interpreter;
pub mod notice;
pub mod registry;
mod router;
pub mod session;
mod spawn;
pub mod stepper;
pub mod turn;

pub use notice::RunNotice;
pub use registry::{DetachedStatus, RegistryError, ResultsRegistry};
pub use session::{OrchestrationSession, SessionBuilder};
pub use stepper::{
    CheckpointStamp, InterpreterState, ResolvedCall, RunStepper, StepperInput, StepperOutput,
    TurnRecord,
};
pub use turn::{ProposedCall, TurnEngine, TurnError, TurnRequest, TurnResponse};

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use marshal_tools::RunId;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::agents::{AgentCatalog, AgentRun, RunEvent, RunHistory, RunOutcome};
use crate::channel::ToolCallChannel;
use crate::checkpoint::CheckpointHook;
use crate::config::RuntimeConfig;
use crate::detectors::{DetectorHandle, EventKind, InteractionEvent};
use interpreter::Interpreter;

/// Shared state of one orchestration session.
pub(crate) struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) catalog: AgentCatalog,
    pub(crate) channel: ToolCallChannel,
    pub(crate) engine: Arc<dyn TurnEngine>,
    pub(crate) registry: Arc<ResultsRegistry>,
    pub(crate) checkpoints: Option<CheckpointHook>,
    pub(crate) detectors: Option<DetectorHandle>,
    pub(crate) notices: broadcast::Sender<RunNotice>,
    pub(crate) root_cancel: CancellationToken,
}

/// Everything needed to start one run.
pub(crate) struct RunLaunch {
    pub run_id: RunId,
    pub parent_id: Option<RunId>,
    pub agent_type: String,
    pub prompt: Option<String>,
    pub params: Value,
    pub depth: u32,
    pub inherited: Option<RunHistory>,
    /// Overrides the definition's budget.
    pub step_budget: Option<u32>,
    /// Narrows the definition's tool set.
    pub restrict_tools: Option<Vec<String>>,
    pub cancel: CancellationToken,
}

impl Runtime {
    /// Runs an agent to a terminal state. The future owns everything it
    /// needs, so it can be spawned.
    pub(crate) fn run_agent(self: &Arc<Self>, launch: RunLaunch) -> BoxFuture<'static, RunOutcome> {
        let runtime = Arc::clone(self);
        let span = info_span!(
            target: "marshal::interpreter",
            "agent_run",
            run_id = %launch.run_id,
            agent_type = %launch.agent_type,
            depth = launch.depth,
        );

        async move {
            let Some(mut definition) = runtime.catalog.get(&launch.agent_type).cloned() else {
                warn!(target: "marshal::interpreter", "unknown agent type");
                let outcome = RunOutcome::rejected(
                    launch.run_id,
                    launch.parent_id,
                    &launch.agent_type,
                    format!("unknown agent type: {}", launch.agent_type),
                );
                runtime.notify(RunNotice::Finished {
                    run_id: outcome.run_id,
                    parent_id: outcome.parent_id,
                    reason: outcome.reason.clone(),
                });
                return outcome;
            };
            if let Some(allowed) = &launch.restrict_tools {
                definition.restrict_tools(allowed);
            }

            let budget = launch
                .step_budget
                .or(definition.step_budget)
                .unwrap_or(runtime.config.interpreter.default_step_budget);
            let mut history = launch.inherited.unwrap_or_default();
            if let Some(prompt) = launch.prompt {
                history.append(RunEvent::UserPrompt { text: prompt });
            }
            let run = AgentRun::new(
                launch.run_id,
                launch.parent_id,
                definition.agent_type.clone(),
                launch.depth,
                launch.params,
                budget,
                history,
            );

            runtime.notify(RunNotice::Started {
                run_id: run.id,
                parent_id: run.parent_id,
                agent_type: run.agent_type.clone(),
                depth: run.depth,
            });
            info!(target: "marshal::interpreter", budget, "agent run started");

            let outcome = Interpreter::new(&runtime, &definition, &launch.cancel)
                .drive(run)
                .await;
            runtime.channel.release(outcome.run_id);

            info!(
                target: "marshal::interpreter",
                status = %outcome.status(),
                turns = outcome.turns_used,
                "agent run finished"
            );
            runtime.notify(RunNotice::Finished {
                run_id: outcome.run_id,
                parent_id: outcome.parent_id,
                reason: outcome.reason.clone(),
            });
            outcome
        }
        .instrument(span)
        .boxed()
    }

    pub(crate) fn notify(&self, notice: RunNotice) {
        // Observers are optional.
        let _ = self.notices.send(notice);
    }

    pub(crate) fn interaction(&self, kind: EventKind, payload: Value) {
        if let Some(detectors) = &self.detectors {
            detectors.ingest(InteractionEvent::now(kind).with_payload(payload));
        }
    }
}
