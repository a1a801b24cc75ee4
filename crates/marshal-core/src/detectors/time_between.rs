use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;

use super::{Detector, DetectorSignal, EventKind, InteractionEvent, SignalDetail, SignalSink, millis};
use crate::config::TimeBetweenSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Comparison {
    /// Interval shorter than the threshold.
    Lt,
    /// Interval at least the threshold.
    Ge,
}

impl Comparison {
    pub fn holds(self, interval_ms: u64, threshold_ms: u64) -> bool {
        match self {
            Comparison::Lt => interval_ms < threshold_ms,
            Comparison::Ge => interval_ms >= threshold_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeBetweenConfig {
    pub name: String,
    pub from: EventKind,
    pub to: EventKind,
    pub comparison: Comparison,
    pub threshold: Duration,
}

impl From<&TimeBetweenSection> for TimeBetweenConfig {
    fn from(section: &TimeBetweenSection) -> Self {
        Self {
            name: section.name.clone(),
            from: EventKind::from(section.from.clone()),
            to: EventKind::from(section.to.clone()),
            comparison: section.comparison,
            threshold: Duration::from_millis(section.threshold_ms),
        }
    }
}

/// Measures from the latest `from` event to the next `to` event.
#[derive(Debug)]
pub struct TimeBetween {
    config: TimeBetweenConfig,
    started_at: Option<u64>,
}

impl TimeBetween {
    pub fn new(config: TimeBetweenConfig) -> Self {
        Self {
            config,
            started_at: None,
        }
    }
}

impl Detector for TimeBetween {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn observe(&mut self, event: &InteractionEvent, sink: &SignalSink) {
        // `to` first so a kind measured against itself closes one interval
        // and opens the next.
        if event.kind == self.config.to {
            if let Some(start) = self.started_at.take() {
                let interval_ms = event.timestamp.saturating_sub(start);
                let threshold_ms = millis(self.config.threshold);
                if self.config.comparison.holds(interval_ms, threshold_ms) {
                    sink.emit(DetectorSignal {
                        detector: self.config.name.clone(),
                        fired_at: event.timestamp,
                        detail: SignalDetail::TimeBetween {
                            interval_ms,
                            threshold_ms,
                            comparison: self.config.comparison,
                        },
                    });
                }
            }
        }
        if event.kind == self.config.from {
            self.started_at = Some(event.timestamp);
        }
    }
}
