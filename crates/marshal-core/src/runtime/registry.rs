use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use marshal_tools::RunId;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::agents::RunOutcome;

const COMPLETION_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum DetachedStatus {
    Running,
    Finished(Arc<RunOutcome>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no detached run with id {0}")]
    Unknown(RunId),
    #[error("run {0} still running")]
    TimedOut(RunId),
}

struct Entry {
    parent_id: Option<RunId>,
    agent_type: String,
    outcome: watch::Sender<Option<Arc<RunOutcome>>>,
}

/// Owner of detached runs' results, keyed by run id.
///
/// Each entry has exactly one writer (the run's own task) and is written once.
pub struct ResultsRegistry {
    entries: Mutex<HashMap<RunId, Entry>>,
    completions: broadcast::Sender<Arc<RunOutcome>>,
}

impl Default for ResultsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultsRegistry {
    pub fn new() -> Self {
        let (completions, _) = broadcast::channel(COMPLETION_BUFFER);
        Self {
            entries: Mutex::new(HashMap::new()),
            completions,
        }
    }

    pub fn register(&self, run_id: RunId, parent_id: Option<RunId>, agent_type: impl Into<String>) {
        let (outcome, _) = watch::channel(None);
        let previous = self.lock().insert(
            run_id,
            Entry {
                parent_id,
                agent_type: agent_type.into(),
                outcome,
            },
        );
        if previous.is_some() {
            warn!(target: "marshal::spawn", %run_id, "detached run registered twice");
        }
    }

    /// Records a run's outcome. Returns false when the id is unknown or an
    /// outcome was already recorded; the first outcome stays.
    pub fn complete(&self, outcome: RunOutcome) -> bool {
        let run_id = outcome.run_id;
        let outcome = Arc::new(outcome);
        let stored = {
            let entries = self.lock();
            let Some(entry) = entries.get(&run_id) else {
                warn!(target: "marshal::spawn", %run_id, "outcome for unregistered run dropped");
                return false;
            };
            entry.outcome.send_if_modified(|slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(Arc::clone(&outcome));
                true
            })
        };

        if stored {
            debug!(target: "marshal::spawn", %run_id, status = %outcome.status(), "detached run finished");
            // Nobody listening is fine.
            let _ = self.completions.send(outcome);
        } else {
            warn!(target: "marshal::spawn", %run_id, "second outcome for detached run ignored");
        }
        stored
    }

    pub fn poll(&self, run_id: RunId) -> Option<DetachedStatus> {
        let entries = self.lock();
        let entry = entries.get(&run_id)?;
        let status = match entry.outcome.borrow().as_ref() {
            Some(outcome) => DetachedStatus::Finished(Arc::clone(outcome)),
            None => DetachedStatus::Running,
        };
        Some(status)
    }

    /// Waits for the run's outcome, up to `timeout` when given.
    pub async fn wait(
        &self,
        run_id: RunId,
        timeout: Option<Duration>,
    ) -> Result<Arc<RunOutcome>, RegistryError> {
        let mut receiver = {
            let entries = self.lock();
            let entry = entries.get(&run_id).ok_or(RegistryError::Unknown(run_id))?;
            entry.outcome.subscribe()
        };

        let finished = async {
            match receiver.wait_for(Option::is_some).await {
                Ok(slot) => slot.as_ref().map(Arc::clone),
                // The sender lives in the map; it only goes away with the registry.
                Err(_) => None,
            }
        };

        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, finished)
                .await
                .map_err(|_| RegistryError::TimedOut(run_id))?,
            None => finished.await,
        };
        outcome.ok_or(RegistryError::Unknown(run_id))
    }

    pub fn children_of(&self, parent_id: RunId) -> Vec<RunId> {
        let mut children: Vec<RunId> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.parent_id == Some(parent_id))
            .map(|(run_id, _)| *run_id)
            .collect();
        children.sort();
        children
    }

    pub fn agent_type(&self, run_id: RunId) -> Option<String> {
        self.lock().get(&run_id).map(|entry| entry.agent_type.clone())
    }

    /// Passive feed of detached completions. Receivers that fall behind miss
    /// entries; the registry itself stays authoritative.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RunOutcome>> {
        self.completions.subscribe()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
