use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use marshal_checkpoint::paths::normalize_file_set;
use marshal_checkpoint::{CheckpointHandle, Operation, RestoreSummary, WorkerReply, WorkerRequest};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use super::CheckpointError;
use super::link::{self, WorkerLink};
use crate::config::{CheckpointSection, WorkerKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMode {
    Thread { store_root: PathBuf },
    Process { program: PathBuf, args: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSettings {
    pub worker: WorkerMode,
    pub request_timeout: Duration,
}

impl CheckpointSettings {
    pub fn from_section(section: &CheckpointSection) -> crate::Result<Self> {
        let store_root = section.resolved_store_root()?;
        let worker = match section.worker {
            WorkerKind::Thread => WorkerMode::Thread { store_root },
            WorkerKind::Process => WorkerMode::Process {
                program: PathBuf::from(&section.worker_program),
                args: vec![
                    "--store-root".to_string(),
                    store_root.to_string_lossy().into_owned(),
                ],
            },
        };
        Ok(Self {
            worker,
            request_timeout: section.request_timeout(),
        })
    }
}

type PendingReplies = Mutex<HashMap<u64, oneshot::Sender<WorkerReply>>>;

/// State shared between one worker connection and its reply reader.
#[derive(Default)]
struct LinkState {
    pending: PendingReplies,
    closed: AtomicBool,
}

impl LinkState {
    fn take(&self, id: u64) -> Option<oneshot::Sender<WorkerReply>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    fn fail_all(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let count = pending.len();
        pending.clear();
        count
    }
}

struct Connection {
    requests: mpsc::UnboundedSender<String>,
    state: Arc<LinkState>,
}

impl Connection {
    fn open(mode: &WorkerMode) -> Result<Self, CheckpointError> {
        let WorkerLink {
            requests,
            mut replies,
        } = match mode {
            WorkerMode::Thread { store_root } => link::spawn_thread(store_root.clone()),
            WorkerMode::Process { program, args } => link::spawn_process(program, args),
        }
        .map_err(CheckpointError::Spawn)?;

        let state = Arc::new(LinkState::default());
        let reader_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(line) = replies.recv().await {
                match serde_json::from_str::<WorkerReply>(&line) {
                    Ok(reply) => match reader_state.take(reply.id) {
                        Some(waiter) => {
                            let _ = waiter.send(reply);
                        }
                        None => {
                            debug!(target: "marshal::checkpoint", request_id = reply.id, "reply for abandoned request");
                        }
                    },
                    Err(e) => {
                        warn!(target: "marshal::checkpoint", error = %e, "unparsable worker reply");
                    }
                }
            }
            reader_state.closed.store(true, Ordering::SeqCst);
            let dropped = reader_state.fail_all();
            if dropped > 0 {
                warn!(target: "marshal::checkpoint", dropped, "checkpoint worker went away with requests in flight");
            } else {
                debug!(target: "marshal::checkpoint", "checkpoint worker connection closed");
            }
        });

        Ok(Self { requests, state })
    }

    fn is_usable(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst) && !self.requests.is_closed()
    }
}

/// Sends snapshot and restore requests to a checkpoint worker and matches the
/// replies.
///
/// The worker is started on first use and restarted on the next request
/// after it exits or stops answering. Operations on the same project are
/// serialized; different projects proceed independently.
pub struct CheckpointManager {
    settings: CheckpointSettings,
    connection: tokio::sync::Mutex<Option<Connection>>,
    next_id: AtomicU64,
    project_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl CheckpointManager {
    pub fn new(settings: CheckpointSettings) -> Self {
        Self {
            settings,
            connection: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            project_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &CheckpointSettings {
        &self.settings
    }

    #[instrument(skip(self, file_set), fields(files = file_set.len()))]
    pub async fn store(
        &self,
        project_dir: &Path,
        file_set: &[String],
        label: Option<&str>,
    ) -> Result<CheckpointHandle, CheckpointError> {
        let file_set = normalize_file_set(file_set).map_err(CheckpointError::InvalidFileSet)?;
        let result = self
            .request(
                Operation::Store,
                project_dir,
                file_set,
                label.map(str::to_string),
                None,
            )
            .await?;

        let raw = result
            .get("checkpointHandle")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CheckpointError::Protocol("store reply without checkpointHandle".to_string())
            })?;
        CheckpointHandle::parse(raw).map_err(|e| CheckpointError::Protocol(e.to_string()))
    }

    #[instrument(skip(self, file_set), fields(files = file_set.len()))]
    pub async fn restore(
        &self,
        project_dir: &Path,
        handle: &CheckpointHandle,
        file_set: &[String],
    ) -> Result<RestoreSummary, CheckpointError> {
        let file_set = normalize_file_set(file_set).map_err(CheckpointError::InvalidFileSet)?;
        let result = self
            .request(
                Operation::Restore,
                project_dir,
                file_set,
                None,
                Some(handle.to_string()),
            )
            .await?;
        serde_json::from_value(result).map_err(|e| CheckpointError::Protocol(e.to_string()))
    }

    /// Stops the worker. A later request starts a new one.
    pub async fn shutdown(&self) {
        if self.connection.lock().await.take().is_some() {
            debug!(target: "marshal::checkpoint", "checkpoint worker released");
        }
    }

    async fn request(
        &self,
        operation: Operation,
        project_dir: &Path,
        file_set: Vec<String>,
        label: Option<String>,
        checkpoint_handle: Option<String>,
    ) -> Result<Value, CheckpointError> {
        let project_lock = self.project_lock(project_dir);
        let _serialized = project_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = WorkerRequest {
            id,
            operation,
            project_dir: project_dir.to_path_buf(),
            file_set,
            label,
            checkpoint_handle,
        };
        let line =
            serde_json::to_string(&request).map_err(|e| CheckpointError::Protocol(e.to_string()))?;

        let (reply, state) = self.dispatch(id, line).await?;
        let reply = match tokio::time::timeout(self.settings.request_timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(CheckpointError::WorkerExited),
            Err(_) => {
                state.take(id);
                self.discard(&state).await;
                let after_ms =
                    u64::try_from(self.settings.request_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(target: "marshal::checkpoint", request_id = id, after_ms, "checkpoint worker unresponsive");
                return Err(CheckpointError::Timeout { after_ms });
            }
        };

        if reply.success {
            reply.result.ok_or_else(|| {
                CheckpointError::Protocol("successful reply without result".to_string())
            })
        } else {
            Err(CheckpointError::Rejected(
                reply
                    .error
                    .unwrap_or_else(|| "no error message".to_string()),
            ))
        }
    }

    async fn dispatch(
        &self,
        id: u64,
        line: String,
    ) -> Result<(oneshot::Receiver<WorkerReply>, Arc<LinkState>), CheckpointError> {
        let mut slot = self.connection.lock().await;
        let connection = match slot.take() {
            Some(connection) if connection.is_usable() => connection,
            previous => {
                if previous.is_some() {
                    debug!(target: "marshal::checkpoint", "restarting checkpoint worker");
                }
                Connection::open(&self.settings.worker)?
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        connection
            .state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, reply_tx);

        let sent = connection.requests.send(line).is_ok();
        // The reader marks the link closed before failing what is pending, so
        // a request registered after that point is caught here.
        if !sent || connection.state.closed.load(Ordering::SeqCst) {
            connection.state.take(id);
            return Err(CheckpointError::WorkerExited);
        }

        let state = Arc::clone(&connection.state);
        *slot = Some(connection);
        Ok((reply_rx, state))
    }

    /// Drops the connection if it is still the one `state` belongs to.
    async fn discard(&self, state: &Arc<LinkState>) {
        let mut slot = self.connection.lock().await;
        if slot
            .as_ref()
            .is_some_and(|connection| Arc::ptr_eq(&connection.state, state))
        {
            *slot = None;
        }
    }

    fn project_lock(&self, project_dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let key = std::fs::canonicalize(project_dir).unwrap_or_else(|_| project_dir.to_path_buf());
        let mut locks = self
            .project_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key).or_default())
    }
}
