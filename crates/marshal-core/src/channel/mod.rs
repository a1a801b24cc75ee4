//! Correlated request/response traffic between agent runs and the remote
//! executor.
//!
//! Calls from one issuer form a chain: a call is not transmitted until the
//! previous call from the same issuer has resolved. Chains of different
//! issuers are independent.

mod connection;
mod executor;

pub use connection::ClientConnection;
pub use executor::{RemoteExecutor, TransportError};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use marshal_tools::wire::decode_reply;
use marshal_tools::{RunId, ToolCall, ToolError, ToolRequest, ToolResult};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, debug_span, warn};

use crate::config::ChannelSection;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    pub call_timeout: Option<Duration>,
}

impl From<&ChannelSection> for ChannelConfig {
    fn from(section: &ChannelSection) -> Self {
        Self {
            call_timeout: section.call_timeout(),
        }
    }
}

pub struct ToolCallChannel {
    executor: Arc<dyn RemoteExecutor>,
    config: ChannelConfig,
    /// Completion signal of the most recently submitted call per issuer.
    chains: Mutex<HashMap<RunId, oneshot::Receiver<()>>>,
}

impl ToolCallChannel {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: ChannelConfig) -> Self {
        Self {
            executor,
            config,
            chains: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Queues `call` behind the issuer's earlier calls. The position in the
    /// chain is taken when this is called, not when the future is first
    /// polled. Dropping the returned future releases the next call.
    pub fn submit(&self, issuer: RunId, call: ToolCall) -> BoxFuture<'static, ToolResult> {
        let (done_tx, done_rx) = oneshot::channel();
        let previous = self
            .chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(issuer, done_rx);

        let executor = Arc::clone(&self.executor);
        let call_timeout = self.config.call_timeout;
        let span = debug_span!(
            target: "marshal::channel",
            "tool_call",
            issuer = %issuer,
            tool = %call.name,
            call_id = %call.id,
        );

        async move {
            if let Some(previous) = previous {
                // A dropped predecessor counts as resolved.
                let _ = previous.await;
            }
            let result = transmit(executor.as_ref(), issuer, &call, call_timeout).await;
            let _ = done_tx.send(());
            result
        }
        .instrument(span)
        .boxed()
    }

    /// Forgets the issuer's chain. Only call once the issuer has no calls in
    /// flight.
    pub fn release(&self, issuer: RunId) {
        self.chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&issuer);
    }

    pub fn active_issuers(&self) -> usize {
        self.chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn transmit(
    executor: &dyn RemoteExecutor,
    issuer: RunId,
    call: &ToolCall,
    call_timeout: Option<Duration>,
) -> ToolResult {
    let request = ToolRequest::from_call(issuer, call);
    debug!(target: "marshal::channel", "transmitting");

    let reply = match call_timeout {
        Some(limit) => match tokio::time::timeout(limit, executor.execute(request)).await {
            Ok(reply) => reply,
            Err(_) => {
                let after_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                warn!(target: "marshal::channel", after_ms, "tool call timed out");
                return ToolResult::Error(ToolError::Timeout {
                    tool_name: call.name.clone(),
                    after_ms,
                });
            }
        },
        None => executor.execute(request).await,
    };

    match reply {
        Ok(body) => {
            let result = decode_reply(&call.name, body);
            if let ToolResult::Error(e) = &result {
                debug!(target: "marshal::channel", error = %e, "tool call resolved with error");
            } else {
                debug!(target: "marshal::channel", "tool call resolved");
            }
            result
        }
        Err(e) => {
            warn!(target: "marshal::channel", error = %e, "remote executor unreachable");
            ToolResult::Error(ToolError::transport(&call.name, e.to_string()))
        }
    }
}
