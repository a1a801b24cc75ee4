//! Child runs started from orchestration tools.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use marshal_tools::tools::{
    AgentHandleStatus, AgentSpawnRequest, AwaitAgentsParams, AwaitedAgent, CheckAgentParams,
    ChildOutcome, ChildReport, DetachedHandle, ResearchOutput, ResearchParams,
    SpawnAgentsAsyncOutput, SpawnAgentsOutput, SpawnAgentsParams,
};
use marshal_tools::{RunId, ToolError};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{DetachedStatus, RegistryError};
use super::router::CallContext;
use super::{RunLaunch, Runtime};
use crate::agents::{FailureKind, RunHistory, RunOutcome, TerminalReason};

struct SpawnRejection {
    agent_type: String,
    message: String,
}

impl SpawnRejection {
    fn report(self) -> ChildReport {
        ChildReport {
            agent_type: self.agent_type,
            run_id: None,
            outcome: ChildOutcome::from(&TerminalReason::failed(FailureKind::Spawn, self.message)),
        }
    }
}

/// Checks a spawn request against the parent's permissions and the depth
/// limit, and builds the child's launch.
fn prepare_child(
    ctx: &CallContext<'_>,
    request: AgentSpawnRequest,
    cancel: CancellationToken,
) -> Result<RunLaunch, SpawnRejection> {
    let reject = |message: String| {
        debug!(target: "marshal::spawn", parent = %ctx.run.id, agent_type = %request.agent_type, %message, "spawn rejected");
        SpawnRejection {
            agent_type: request.agent_type.clone(),
            message,
        }
    };

    if !ctx.definition.can_spawn(&request.agent_type) {
        return Err(reject(format!(
            "{} may not spawn {}",
            ctx.definition.agent_type, request.agent_type
        )));
    }
    let Some(child) = ctx.runtime.catalog.get(&request.agent_type) else {
        return Err(reject(format!("unknown agent type: {}", request.agent_type)));
    };
    let depth = ctx.run.depth + 1;
    let max_depth = ctx.runtime.config.interpreter.max_spawn_depth;
    if depth > max_depth {
        return Err(reject(format!("spawn depth limit of {max_depth} reached")));
    }

    let inherited = child
        .inherit_history
        .then(|| RunHistory::inherited_from(&ctx.run.history));
    Ok(RunLaunch {
        run_id: RunId::new(),
        parent_id: Some(ctx.run.id),
        agent_type: request.agent_type,
        prompt: request.prompt,
        params: request.params.unwrap_or_else(|| json!({})),
        depth,
        inherited,
        step_budget: None,
        restrict_tools: None,
        cancel,
    })
}

fn child_report(outcome: &RunOutcome) -> ChildReport {
    ChildReport {
        agent_type: outcome.agent_type.clone(),
        run_id: Some(outcome.run_id),
        outcome: outcome.child_outcome(),
    }
}

enum Slot {
    Rejected(ChildReport),
    Running {
        agent_type: String,
        run_id: RunId,
        task: JoinHandle<RunOutcome>,
    },
}

/// Starts every requested child concurrently and waits for all of them.
/// Reports come back in request order whatever order the children finish in.
pub(crate) async fn spawn_blocking(
    ctx: &CallContext<'_>,
    params: SpawnAgentsParams,
) -> Result<SpawnAgentsOutput, ToolError> {
    // Children die with the call that started them.
    let group = ctx.cancel.child_token();
    let _group_guard = group.clone().drop_guard();

    let slots: Vec<Slot> = params
        .agents
        .into_iter()
        .map(|request| match prepare_child(ctx, request, group.clone()) {
            Ok(launch) => Slot::Running {
                agent_type: launch.agent_type.clone(),
                run_id: launch.run_id,
                task: tokio::spawn(ctx.runtime.run_agent(launch)),
            },
            Err(rejection) => Slot::Rejected(rejection.report()),
        })
        .collect();
    info!(target: "marshal::spawn", parent = %ctx.run.id, children = slots.len(), "waiting on child runs");

    let results = join_all(slots.into_iter().map(|slot| async move {
        match slot {
            Slot::Rejected(report) => report,
            Slot::Running {
                agent_type,
                run_id,
                task,
            } => match task.await {
                Ok(outcome) => child_report(&outcome),
                Err(e) => {
                    warn!(target: "marshal::spawn", %run_id, error = %e, "child task ended abnormally");
                    ChildReport {
                        agent_type,
                        run_id: Some(run_id),
                        outcome: ChildOutcome::from(&TerminalReason::failed(
                            FailureKind::Internal,
                            e.to_string(),
                        )),
                    }
                }
            },
        }
    }))
    .await;

    Ok(SpawnAgentsOutput { results })
}

/// Starts children that outlive the calling run. Their outcomes land in the
/// results registry.
pub(crate) fn spawn_detached(
    ctx: &CallContext<'_>,
    params: SpawnAgentsParams,
) -> Result<SpawnAgentsAsyncOutput, ToolError> {
    let runtime: &Arc<Runtime> = ctx.runtime;
    let handles = params
        .agents
        .into_iter()
        .map(|request| {
            // Tied to the session, not to the parent run.
            let cancel = runtime.root_cancel.child_token();
            match prepare_child(ctx, request, cancel) {
                Ok(launch) => {
                    let run_id = launch.run_id;
                    let agent_type = launch.agent_type.clone();
                    runtime
                        .registry
                        .register(run_id, launch.parent_id, agent_type.clone());
                    let parent_id = launch.parent_id;
                    let registry = Arc::clone(&runtime.registry);
                    let task = tokio::spawn(runtime.run_agent(launch));
                    let recorded_type = agent_type.clone();
                    // The registry must hear about the run even if it panics.
                    tokio::spawn(async move {
                        let outcome = match task.await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                warn!(target: "marshal::spawn", %run_id, error = %e, "detached run ended abnormally");
                                RunOutcome {
                                    run_id,
                                    parent_id,
                                    agent_type: recorded_type,
                                    reason: TerminalReason::failed(FailureKind::Internal, e.to_string()),
                                    turns_used: 0,
                                    history: RunHistory::default(),
                                }
                            }
                        };
                        registry.complete(outcome);
                    });
                    info!(target: "marshal::spawn", parent = %ctx.run.id, %run_id, %agent_type, "detached run started");
                    DetachedHandle::Started { agent_type, run_id }
                }
                Err(rejection) => DetachedHandle::Rejected {
                    agent_type: rejection.agent_type,
                    message: rejection.message,
                },
            }
        })
        .collect();
    Ok(SpawnAgentsAsyncOutput { handles })
}

/// Fans prompts out to read-only research agents, at most
/// `max_concurrency` at a time, and returns one summary per prompt in order.
pub(crate) async fn research(
    ctx: &CallContext<'_>,
    params: ResearchParams,
) -> Result<ResearchOutput, ToolError> {
    let settings = &ctx.runtime.config.research;
    let depth = ctx.run.depth + 1;
    let max_depth = ctx.runtime.config.interpreter.max_spawn_depth;
    if depth > max_depth {
        let message = format!("research failed: spawn depth limit of {max_depth} reached");
        return Ok(ResearchOutput {
            summaries: vec![message; params.prompts.len()],
        });
    }

    let group = ctx.cancel.child_token();
    let _group_guard = group.clone().drop_guard();
    let runtime = Arc::clone(ctx.runtime);
    let parent_id = ctx.run.id;
    info!(
        target: "marshal::spawn",
        parent = %parent_id,
        prompts = params.prompts.len(),
        concurrency = settings.max_concurrency,
        "research fan-out"
    );

    let summaries: Vec<String> = stream::iter(params.prompts)
        .map(|prompt| {
            runtime.run_agent(RunLaunch {
                run_id: RunId::new(),
                parent_id: Some(parent_id),
                agent_type: settings.agent_type.clone(),
                prompt: Some(prompt),
                params: json!({}),
                depth,
                inherited: None,
                step_budget: Some(settings.step_budget),
                restrict_tools: Some(settings.tools.clone()),
                cancel: group.clone(),
            })
        })
        .buffered(settings.max_concurrency.max(1))
        .map(|outcome| summarize(&outcome))
        .collect()
        .await;

    Ok(ResearchOutput { summaries })
}

fn summarize(outcome: &RunOutcome) -> String {
    match &outcome.reason {
        TerminalReason::Completed {
            output: Some(Value::String(text)),
        } => text.clone(),
        TerminalReason::Completed {
            output: Some(output),
        } => output.to_string(),
        TerminalReason::Completed { output: None } => outcome
            .history
            .last_assistant_text()
            .unwrap_or_else(|| "no findings".to_string()),
        TerminalReason::BudgetExhausted => outcome
            .history
            .last_assistant_text()
            .unwrap_or_else(|| "research stopped: step budget exhausted".to_string()),
        TerminalReason::Failed { kind, message } => format!("research failed ({kind}): {message}"),
        TerminalReason::Cancelled => "research cancelled".to_string(),
    }
}

fn handle_status(status: Option<DetachedStatus>) -> AgentHandleStatus {
    match status {
        None => AgentHandleStatus::Unknown,
        Some(DetachedStatus::Running) => AgentHandleStatus::Running,
        Some(DetachedStatus::Finished(outcome)) => AgentHandleStatus::Finished {
            outcome: outcome.child_outcome(),
        },
    }
}

pub(crate) fn check_agent(
    ctx: &CallContext<'_>,
    params: CheckAgentParams,
) -> Result<AwaitedAgent, ToolError> {
    let status = match params.run_id.parse::<RunId>() {
        Ok(run_id) => handle_status(ctx.runtime.registry.poll(run_id)),
        Err(_) => AgentHandleStatus::Unknown,
    };
    Ok(AwaitedAgent {
        run_id: params.run_id,
        status,
    })
}

/// Waits on each handle in turn under one shared deadline. Handles still
/// running at the deadline are reported as running.
pub(crate) async fn await_agents(
    ctx: &CallContext<'_>,
    params: AwaitAgentsParams,
) -> Result<Vec<AwaitedAgent>, ToolError> {
    let registry = &ctx.runtime.registry;
    let deadline = params
        .timeout_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    let mut awaited = Vec::with_capacity(params.run_ids.len());
    for raw in params.run_ids {
        let status = match raw.parse::<RunId>() {
            Err(_) => AgentHandleStatus::Unknown,
            Ok(run_id) => {
                let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
                match registry.wait(run_id, remaining).await {
                    Ok(outcome) => AgentHandleStatus::Finished {
                        outcome: outcome.child_outcome(),
                    },
                    Err(RegistryError::TimedOut(_)) => AgentHandleStatus::Running,
                    Err(RegistryError::Unknown(_)) => AgentHandleStatus::Unknown,
                }
            }
        };
        awaited.push(AwaitedAgent {
            run_id: raw,
            status,
        });
    }
    Ok(awaited)
}
