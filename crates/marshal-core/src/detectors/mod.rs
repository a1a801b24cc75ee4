//! Passive pattern matchers over the interaction event stream.
//!
//! Detectors never influence orchestration; they only emit signals on a
//! broadcast channel owned by the [`DetectorSet`] of a session.

mod count_window;
mod hub;
mod time_between;
mod timeout;

pub use count_window::{CountInWindow, CountInWindowConfig};
pub use hub::{DetectorHandle, DetectorSet};
pub use time_between::{Comparison, TimeBetween, TimeBetweenConfig};
pub use timeout::{AsyncPredicate, TimeoutConfig, TimeoutWithPredicate};

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    KeyPress,
    PromptSubmitted,
    CommandExit,
    ResponseStarted,
    ResponseFinished,
    ToolCallStarted,
    ToolCallFinished,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::KeyPress => "key_press",
            EventKind::PromptSubmitted => "prompt_submitted",
            EventKind::CommandExit => "command_exit",
            EventKind::ResponseStarted => "response_started",
            EventKind::ResponseFinished => "response_finished",
            EventKind::ToolCallStarted => "tool_call_started",
            EventKind::ToolCallFinished => "tool_call_finished",
            EventKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "key_press" => EventKind::KeyPress,
            "prompt_submitted" => EventKind::PromptSubmitted,
            "command_exit" => EventKind::CommandExit,
            "response_started" => EventKind::ResponseStarted,
            "response_finished" => EventKind::ResponseFinished,
            "tool_call_started" => EventKind::ToolCallStarted,
            "tool_call_finished" => EventKind::ToolCallFinished,
            _ => EventKind::Custom(raw),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventKind::from(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub kind: EventKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

impl InteractionEvent {
    pub fn new(kind: EventKind, timestamp: u64) -> Self {
        Self {
            kind,
            timestamp,
            payload: Value::Null,
        }
    }

    pub fn now(kind: EventKind) -> Self {
        Self::new(kind, now_millis())
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detector", rename_all = "snake_case")]
pub enum SignalDetail {
    CountInWindow {
        count: usize,
        window_ms: u64,
    },
    TimeBetween {
        interval_ms: u64,
        threshold_ms: u64,
        comparison: Comparison,
    },
    Timeout {
        armed_at: u64,
        delay_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSignal {
    pub detector: String,
    pub fired_at: u64,
    pub detail: SignalDetail,
}

/// Where detectors publish what they find.
#[derive(Debug, Clone)]
pub struct SignalSink {
    signals: broadcast::Sender<DetectorSignal>,
}

impl SignalSink {
    pub fn new(signals: broadcast::Sender<DetectorSignal>) -> Self {
        Self { signals }
    }

    pub fn emit(&self, signal: DetectorSignal) {
        debug!(target: "marshal::detectors", detector = %signal.detector, fired_at = signal.fired_at, "detector fired");
        // Signals are advisory; no subscriber is not an error.
        let _ = self.signals.send(signal);
    }
}

/// A stateful matcher. Each instance owns its window.
pub trait Detector: Send {
    fn name(&self) -> &str;

    fn observe(&mut self, event: &InteractionEvent, sink: &SignalSink);

    /// Called once when the owning set stops.
    fn shutdown(&mut self) {}
}
