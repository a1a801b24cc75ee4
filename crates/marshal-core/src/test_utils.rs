//! Scripted collaborators for exercising the runtime without a model or a
//! real executor.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use marshal_tools::tools::{ORCHESTRATION_TOOLS, READ_ONLY_TOOLS};
use marshal_tools::{ToolRequest, ToolResult};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::agents::{AgentDefinition, ProgramStep, Resume, StepDirective, StepProgram, program_fn};
use crate::channel::{RemoteExecutor, TransportError};
use crate::runtime::{TurnEngine, TurnError, TurnRequest, TurnResponse};

/// Installs a fmt subscriber for the current test binary. Quiet unless
/// `RUST_LOG` says otherwise.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")))
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    Started(String),
    Finished(String),
}

#[derive(Default)]
struct LogInner {
    events: Vec<ExecutorEvent>,
    requests: Vec<ToolRequest>,
}

/// Shared view of what a [`RecordingExecutor`] saw.
#[derive(Clone, Default)]
pub struct ExecutorLog {
    inner: Arc<Mutex<LogInner>>,
}

impl ExecutorLog {
    pub fn events(&self) -> Vec<ExecutorEvent> {
        self.lock().events.clone()
    }

    pub fn requests(&self) -> Vec<ToolRequest> {
        self.lock().requests.clone()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.lock()
            .requests
            .iter()
            .map(|request| request.tool_name.clone())
            .collect()
    }

    fn record(&self, event: ExecutorEvent) {
        self.lock().events.push(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Responder = Arc<dyn Fn(&ToolRequest) -> Result<Value, TransportError> + Send + Sync>;

/// A remote executor that answers from a closure and records call order.
pub struct RecordingExecutor {
    respond: Responder,
    delays: HashMap<String, Duration>,
    silent_tools: HashSet<String>,
    silent: bool,
    log: ExecutorLog,
}

impl RecordingExecutor {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&ToolRequest) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        Self {
            respond: Arc::new(respond),
            delays: HashMap::new(),
            silent_tools: HashSet::new(),
            silent: false,
            log: ExecutorLog::default(),
        }
    }

    /// Replies with the call's own input as output.
    pub fn echo() -> Self {
        Self::new(|request| Ok(json!({ "output": request.input })))
    }

    /// Never replies to anything.
    pub fn silent() -> Self {
        let mut executor = Self::echo();
        executor.silent = true;
        executor
    }

    pub fn unreachable() -> Self {
        Self::new(|_| Err(TransportError::Unreachable("connection refused".to_string())))
    }

    pub fn with_delay(mut self, tool_name: &str, delay: Duration) -> Self {
        self.delays.insert(tool_name.to_string(), delay);
        self
    }

    /// Never replies to calls of `tool_name`.
    pub fn with_silence(mut self, tool_name: &str) -> Self {
        self.silent_tools.insert(tool_name.to_string());
        self
    }

    pub fn log(&self) -> ExecutorLog {
        self.log.clone()
    }
}

#[async_trait]
impl RemoteExecutor for RecordingExecutor {
    async fn execute(&self, request: ToolRequest) -> Result<Value, TransportError> {
        let tool_name = request.tool_name.clone();
        {
            let mut log = self.log.lock();
            log.events.push(ExecutorEvent::Started(tool_name.clone()));
            log.requests.push(request.clone());
        }

        if self.silent || self.silent_tools.contains(&tool_name) {
            futures::future::pending::<()>().await;
        }
        if let Some(delay) = self.delays.get(&tool_name) {
            tokio::time::sleep(*delay).await;
        }

        let reply = (self.respond)(&request);
        self.log.record(ExecutorEvent::Finished(tool_name));
        reply
    }
}

type Script = Arc<dyn Fn(&TurnRequest) -> Result<TurnResponse, TurnError> + Send + Sync>;
type Latency = Arc<dyn Fn(&TurnRequest) -> Duration + Send + Sync>;

/// A turn engine driven by a closure. Tracks how many turns ran and how many
/// were in flight at once.
pub struct ScriptedEngine {
    script: Script,
    latency: Option<Latency>,
    turns: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedEngine {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&TurnRequest) -> Result<TurnResponse, TurnError> + Send + Sync + 'static,
    {
        Self {
            script: Arc::new(script),
            latency: None,
            turns: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every turn answers with `text`, optionally ending the turn.
    pub fn replying(text: &str, end_turn: bool) -> Self {
        let text = text.to_string();
        Self::new(move |_| Ok(TurnResponse::text(text.clone(), end_turn)))
    }

    /// Each turn answers with the text of the run's first prompt.
    pub fn echoing_prompt() -> Self {
        Self::new(|request| {
            let prompt = request
                .history
                .events()
                .find_map(|event| match event {
                    crate::agents::RunEvent::UserPrompt { text } => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            Ok(TurnResponse::text(prompt, true))
        })
    }

    pub fn with_latency<F>(mut self, latency: F) -> Self
    where
        F: Fn(&TurnRequest) -> Duration + Send + Sync + 'static,
    {
        self.latency = Some(Arc::new(latency));
        self
    }

    pub fn turns(&self) -> usize {
        self.turns.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TurnEngine for ScriptedEngine {
    async fn next_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnResponse, TurnError> {
        self.turns.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(Arc::clone(&self.in_flight));
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(latency) = &self.latency {
            let delay = latency(&request);
            tokio::select! {
                () = cancel.cancelled() => return Err(TurnError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
        (self.script)(&request)
    }
}

fn tool_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_string()).collect()
}

/// An agent that may only read.
pub fn reader(agent_type: &str) -> AgentDefinition {
    AgentDefinition::new(agent_type).with_tools(tool_names(READ_ONLY_TOOLS))
}

/// An agent with every orchestration tool that may spawn `children`.
pub fn orchestrator(agent_type: &str, children: &[&str]) -> AgentDefinition {
    AgentDefinition::new(agent_type)
        .with_tools(tool_names(ORCHESTRATION_TOOLS))
        .with_spawnable(tool_names(children))
}

/// A program that issues one tool call and returns the call's output, or the
/// error text when it failed.
pub fn call_once(tool_name: &str, input: Value) -> Arc<dyn StepProgram> {
    let tool_name = tool_name.to_string();
    program_fn(move |view| match view.resume {
        Resume::Start => ProgramStep::Yield(StepDirective::tool(tool_name.clone(), input.clone())),
        Resume::ToolResult { result, .. } => ProgramStep::Return(Some(result_value(result))),
        Resume::StepComplete { .. } => ProgramStep::Return(None),
    })
}

pub fn result_value(result: &ToolResult) -> Value {
    match result {
        ToolResult::Output(value) => value.clone(),
        ToolResult::Error(error) => json!({ "error": error.kind().to_string(), "message": error.to_string() }),
    }
}
