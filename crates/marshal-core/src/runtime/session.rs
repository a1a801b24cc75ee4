use std::path::PathBuf;
use std::sync::Arc;

use marshal_tools::RunId;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::ResultsRegistry;
use super::turn::TurnEngine;
use super::{RunLaunch, RunNotice, Runtime};
use crate::agents::{AgentCatalog, AgentDefinition, RunOutcome};
use crate::channel::{ChannelConfig, RemoteExecutor, ToolCallChannel};
use crate::checkpoint::{CheckpointHook, CheckpointManager, CheckpointSettings, SnapshotPolicy};
use crate::config::RuntimeConfig;
use crate::detectors::{Detector, DetectorHandle, DetectorSet, DetectorSignal, InteractionEvent};
use crate::error::{Error, Result};

const NOTICE_BUFFER: usize = 256;

pub struct SessionBuilder {
    config: RuntimeConfig,
    catalog: AgentCatalog,
    executor: Option<Arc<dyn RemoteExecutor>>,
    engine: Option<Arc<dyn TurnEngine>>,
    project_dir: Option<PathBuf>,
    checkpoint_manager: Option<Arc<CheckpointManager>>,
    detectors: Vec<Box<dyn Detector>>,
}

impl SessionBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            catalog: AgentCatalog::new(),
            executor: None,
            engine: None,
            project_dir: None,
            checkpoint_manager: None,
            detectors: Vec::new(),
        }
    }

    pub fn agent(mut self, definition: AgentDefinition) -> Self {
        self.catalog.register(definition);
        self
    }

    pub fn catalog(mut self, catalog: AgentCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn turn_engine(mut self, engine: Arc<dyn TurnEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Project whose files mutating tool calls are checkpointed.
    pub fn project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    /// Uses this manager instead of one built from the checkpoint config.
    pub fn checkpoint_manager(mut self, manager: Arc<CheckpointManager>) -> Self {
        self.checkpoint_manager = Some(manager);
        self
    }

    /// Adds a detector on top of the configured ones.
    pub fn detector(mut self, detector: Box<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Must be called within a Tokio runtime when detectors are configured.
    pub fn build(self) -> Result<OrchestrationSession> {
        self.config.validate()?;
        let executor = self
            .executor
            .ok_or_else(|| Error::Configuration("no remote executor configured".to_string()))?;
        let engine = self
            .engine
            .ok_or_else(|| Error::Configuration("no turn engine configured".to_string()))?;

        let checkpoints = match (self.checkpoint_manager, self.project_dir) {
            (Some(manager), Some(project_dir)) => Some(CheckpointHook {
                manager,
                policy: SnapshotPolicy::from_section(&self.config.checkpoint),
                project_dir,
            }),
            (None, Some(project_dir)) if self.config.checkpoint.enabled => {
                let settings = CheckpointSettings::from_section(&self.config.checkpoint)?;
                Some(CheckpointHook {
                    manager: Arc::new(CheckpointManager::new(settings)),
                    policy: SnapshotPolicy::from_section(&self.config.checkpoint),
                    project_dir,
                })
            }
            (Some(_), None) => {
                return Err(Error::Configuration(
                    "a checkpoint manager needs a project directory".to_string(),
                ));
            }
            (None, _) => None,
        };

        let mut set = DetectorSet::from_config(&self.config.detectors);
        for detector in self.detectors {
            set.add(detector);
        }
        let detectors = (!set.is_empty()).then(|| set.start());

        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let channel = ToolCallChannel::new(executor, ChannelConfig::from(&self.config.channel));
        info!(
            target: "marshal::interpreter",
            agents = self.catalog.agent_types().count(),
            checkpoints = checkpoints.is_some(),
            detectors = detectors.is_some(),
            "session ready"
        );

        Ok(OrchestrationSession {
            runtime: Arc::new(Runtime {
                config: self.config,
                catalog: self.catalog,
                channel,
                engine,
                registry: Arc::new(ResultsRegistry::new()),
                checkpoints,
                detectors,
                notices,
                root_cancel: CancellationToken::new(),
            }),
        })
    }
}

/// Everything one orchestration needs: agents, the executor channel, the
/// results registry, checkpointing and detectors.
pub struct OrchestrationSession {
    runtime: Arc<Runtime>,
}

impl OrchestrationSession {
    pub fn builder(config: RuntimeConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Runs a root agent to a terminal state. Errors only when the run cannot
    /// start; everything after that is reported in the outcome.
    pub async fn run(
        &self,
        agent_type: &str,
        prompt: impl Into<String>,
        params: Value,
    ) -> Result<RunOutcome> {
        if !self.runtime.catalog.contains(agent_type) {
            return Err(Error::UnknownAgent(agent_type.to_string()));
        }
        if self.runtime.root_cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let launch = RunLaunch {
            run_id: RunId::new(),
            parent_id: None,
            agent_type: agent_type.to_string(),
            prompt: Some(prompt.into()),
            params,
            depth: 0,
            inherited: None,
            step_budget: None,
            restrict_tools: None,
            cancel: self.runtime.root_cancel.child_token(),
        };
        Ok(self.runtime.run_agent(launch).await)
    }

    /// Outcomes of detached runs started by any agent of this session.
    pub fn registry(&self) -> &Arc<ResultsRegistry> {
        &self.runtime.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunNotice> {
        self.runtime.notices.subscribe()
    }

    pub fn detector_signals(&self) -> Option<broadcast::Receiver<DetectorSignal>> {
        self.runtime.detectors.as_ref().map(DetectorHandle::subscribe)
    }

    /// Feeds an externally observed event, such as a key press, to the
    /// detectors.
    pub fn ingest(&self, event: InteractionEvent) {
        if let Some(detectors) = &self.runtime.detectors {
            detectors.ingest(event);
        }
    }

    pub fn checkpoints(&self) -> Option<&Arc<CheckpointManager>> {
        self.runtime.checkpoints.as_ref().map(|hook| &hook.manager)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime.config
    }

    /// Cancels every run of the session, detached ones included.
    pub fn cancel_all(&self) {
        debug!(target: "marshal::interpreter", "cancelling all runs");
        self.runtime.root_cancel.cancel();
    }

    pub async fn shutdown(self) {
        self.cancel_all();
        if let Some(detectors) = &self.runtime.detectors {
            detectors.shutdown().await;
        }
        if let Some(hook) = &self.runtime.checkpoints {
            hook.manager.shutdown().await;
        }
        info!(target: "marshal::interpreter", "session shut down");
    }
}
