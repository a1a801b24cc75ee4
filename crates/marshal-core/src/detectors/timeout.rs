use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::{Detector, DetectorSignal, EventKind, InteractionEvent, SignalDetail, SignalSink, millis};

/// Checked once when the delay runs out.
pub type AsyncPredicate = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutConfig {
    pub name: String,
    pub arm_on: Vec<EventKind>,
    /// Events that cancel a pending check.
    pub disarm_on: Vec<EventKind>,
    pub delay: Duration,
}

/// Fires when, `delay` after an arming event, the predicate still holds.
///
/// A new arming event replaces the pending check. Requires a Tokio runtime.
pub struct TimeoutWithPredicate {
    config: TimeoutConfig,
    predicate: AsyncPredicate,
    armed: Option<CancellationToken>,
}

impl TimeoutWithPredicate {
    pub fn new(config: TimeoutConfig, predicate: AsyncPredicate) -> Self {
        Self {
            config,
            predicate,
            armed: None,
        }
    }

    fn disarm(&mut self) {
        if let Some(token) = self.armed.take() {
            token.cancel();
        }
    }
}

impl Detector for TimeoutWithPredicate {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn observe(&mut self, event: &InteractionEvent, sink: &SignalSink) {
        if self.config.disarm_on.contains(&event.kind) {
            self.disarm();
        }
        if !self.config.arm_on.contains(&event.kind) {
            return;
        }
        self.disarm();

        let token = CancellationToken::new();
        self.armed = Some(token.clone());
        let predicate = Arc::clone(&self.predicate);
        let sink = sink.clone();
        let name = self.config.name.clone();
        let delay = self.config.delay;
        let armed_at = event.timestamp;

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let still_holds = tokio::select! {
                        () = token.cancelled() => false,
                        holds = predicate() => holds,
                    };
                    if still_holds {
                        sink.emit(DetectorSignal {
                            detector: name,
                            fired_at: armed_at.saturating_add(millis(delay)),
                            detail: SignalDetail::Timeout {
                                armed_at,
                                delay_ms: millis(delay),
                            },
                        });
                    }
                }
            }
        });
    }

    fn shutdown(&mut self) {
        self.disarm();
    }
}
