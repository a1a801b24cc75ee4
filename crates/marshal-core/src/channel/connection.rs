use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use marshal_tools::{ToolCallId, ToolRequest};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::executor::{RemoteExecutor, TransportError};

type PendingReplies = Mutex<HashMap<ToolCallId, oneshot::Sender<Value>>>;

/// Remote executor backed by an outbound request queue and replies delivered
/// by id, e.g. from a websocket reader.
#[derive(Debug)]
pub struct ClientConnection {
    outbound: mpsc::UnboundedSender<ToolRequest>,
    pending: PendingReplies,
}

impl ClientConnection {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ToolRequest>) {
        let (outbound, requests) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
        });
        (connection, requests)
    }

    /// Hands a reply body to the waiting call. Returns false when no call is
    /// waiting on `id`, which includes replies that were already delivered.
    pub fn deliver(&self, id: &ToolCallId, body: Value) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match waiter {
            Some(waiter) => {
                if waiter.send(body).is_err() {
                    debug!(target: "marshal::channel", call_id = %id, "waiter gone before delivery");
                    return false;
                }
                true
            }
            None => {
                warn!(target: "marshal::channel", call_id = %id, "reply for unknown or already resolved call");
                false
            }
        }
    }

    /// Fails every waiting call with a transport error.
    pub fn disconnect(&self) {
        let dropped = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            warn!(target: "marshal::channel", dropped, "client disconnected with calls in flight");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    id: ToolCallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[async_trait]
impl RemoteExecutor for ClientConnection {
    async fn execute(&self, request: ToolRequest) -> Result<Value, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = request.id.clone();
        if self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), reply_tx)
            .is_some()
        {
            warn!(target: "marshal::channel", call_id = %id, "duplicate call id replaced an earlier waiter");
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.outbound
            .send(request)
            .map_err(|_| TransportError::Unreachable("client request queue closed".to_string()))?;

        reply_rx.await.map_err(|_| TransportError::Closed)
    }
}
