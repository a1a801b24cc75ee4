use std::collections::VecDeque;
use std::time::Duration;

use tracing::warn;

use super::{Detector, DetectorSignal, EventKind, InteractionEvent, SignalDetail, SignalSink, millis};
use crate::config::CountInWindowSection;

#[derive(Debug, Clone, PartialEq)]
pub struct CountInWindowConfig {
    pub name: String,
    pub kinds: Vec<EventKind>,
    pub threshold: usize,
    pub window: Duration,
    pub debounce: Duration,
    /// Most recent matching events kept for evaluation.
    pub history_limit: usize,
}

impl From<&CountInWindowSection> for CountInWindowConfig {
    fn from(section: &CountInWindowSection) -> Self {
        Self {
            name: section.name.clone(),
            kinds: section.kinds.iter().cloned().map(EventKind::from).collect(),
            threshold: section.threshold,
            window: Duration::from_millis(section.window_ms),
            debounce: Duration::from_millis(section.debounce_ms),
            history_limit: section.history_limit,
        }
    }
}

/// Fires when at least `threshold` matching events fall inside the sliding
/// window, at most once per debounce interval.
#[derive(Debug)]
pub struct CountInWindow {
    config: CountInWindowConfig,
    history: VecDeque<u64>,
    last_fired: Option<u64>,
}

impl CountInWindow {
    pub fn new(config: CountInWindowConfig) -> Self {
        if config.history_limit < config.threshold {
            warn!(
                target: "marshal::detectors",
                detector = %config.name,
                history_limit = config.history_limit,
                threshold = config.threshold,
                "history limit below threshold, detector can never fire"
            );
        }
        let capacity = config.history_limit;
        Self {
            config,
            history: VecDeque::with_capacity(capacity),
            last_fired: None,
        }
    }

    pub fn window_len(&self) -> usize {
        self.history.len()
    }

    fn debouncing(&self, now: u64) -> bool {
        self.last_fired
            .is_some_and(|fired| now.saturating_sub(fired) < millis(self.config.debounce))
    }
}

impl Detector for CountInWindow {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn observe(&mut self, event: &InteractionEvent, sink: &SignalSink) {
        if !self.config.kinds.contains(&event.kind) {
            return;
        }
        let now = event.timestamp;
        let window_ms = millis(self.config.window);

        self.history.push_back(now);
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
        while self
            .history
            .front()
            .is_some_and(|&seen| now.saturating_sub(seen) > window_ms)
        {
            self.history.pop_front();
        }

        if self.history.len() < self.config.threshold || self.debouncing(now) {
            return;
        }
        self.last_fired = Some(now);
        sink.emit(DetectorSignal {
            detector: self.config.name.clone(),
            fired_at: now,
            detail: SignalDetail::CountInWindow {
                count: self.history.len(),
                window_ms,
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    fn detector(debounce_ms: u64, history_limit: usize) -> CountInWindow {
        CountInWindow::new(CountInWindowConfig {
            name: "rapid-keystrokes".to_string(),
            kinds: vec![EventKind::KeyPress],
            threshold: 5,
            window: Duration::from_millis(1000),
            debounce: Duration::from_millis(debounce_ms),
            history_limit,
        })
    }

    fn feed(detector: &mut CountInWindow, sink: &SignalSink, kind: EventKind, at: u64) {
        detector.observe(&InteractionEvent::new(kind, at), sink);
    }

    fn drain(signals: &mut broadcast::Receiver<DetectorSignal>) -> Vec<u64> {
        let mut fired = Vec::new();
        while let Ok(signal) = signals.try_recv() {
            fired.push(signal.fired_at);
        }
        fired
    }

    #[test]
    fn fires_once_then_debounces_then_fires_again() {
        let (tx, mut signals) = broadcast::channel(16);
        let sink = SignalSink::new(tx);
        let mut detector = detector(500, 32);

        for at in [0, 225, 450, 675, 900] {
            feed(&mut detector, &sink, EventKind::KeyPress, at);
        }
        assert_eq!(drain(&mut signals), vec![900]);

        feed(&mut detector, &sink, EventKind::KeyPress, 950);
        assert!(drain(&mut signals).is_empty());

        feed(&mut detector, &sink, EventKind::KeyPress, 1450);
        assert_eq!(drain(&mut signals), vec![1450]);
    }

    #[test]
    fn events_outside_the_window_do_not_count() {
        let (tx, mut signals) = broadcast::channel(16);
        let sink = SignalSink::new(tx);
        let mut detector = detector(0, 32);

        for at in [0, 400, 800, 1200, 1600] {
            feed(&mut detector, &sink, EventKind::KeyPress, at);
        }

        assert!(drain(&mut signals).is_empty());
        assert_eq!(detector.window_len(), 3);
    }

    #[test]
    fn other_kinds_are_ignored() {
        let (tx, mut signals) = broadcast::channel(16);
        let sink = SignalSink::new(tx);
        let mut detector = detector(0, 32);

        for at in 0..10 {
            feed(&mut detector, &sink, EventKind::CommandExit, at * 10);
        }

        assert!(drain(&mut signals).is_empty());
        assert_eq!(detector.window_len(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let (tx, mut signals) = broadcast::channel(16);
        let sink = SignalSink::new(tx);
        let mut detector = detector(0, 4);

        for at in 0..8 {
            feed(&mut detector, &sink, EventKind::KeyPress, at);
        }

        // Four retained events can never reach a threshold of five.
        assert!(drain(&mut signals).is_empty());
        assert_eq!(detector.window_len(), 4);
    }
}
