use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    CountInWindow, CountInWindowConfig, Detector, DetectorSignal, InteractionEvent, SignalSink,
    TimeBetween, TimeBetweenConfig,
};
use crate::config::DetectorsSection;

const SIGNAL_BUFFER: usize = 128;

/// The detectors of one session, before they start observing.
#[derive(Default)]
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(section: &DetectorsSection) -> Self {
        let mut set = Self::new();
        for config in &section.count_in_window {
            set.add(Box::new(CountInWindow::new(CountInWindowConfig::from(config))));
        }
        for config in &section.time_between {
            set.add(Box::new(TimeBetween::new(TimeBetweenConfig::from(config))));
        }
        set
    }

    pub fn add(&mut self, detector: Box<dyn Detector>) {
        self.detectors.push(detector);
    }

    pub fn with(mut self, detector: Box<dyn Detector>) -> Self {
        self.add(detector);
        self
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Moves the detectors onto their own task. Must be called within a Tokio
    /// runtime.
    pub fn start(self) -> DetectorHandle {
        let (events_tx, mut events) = mpsc::unbounded_channel::<InteractionEvent>();
        let (signals, _) = broadcast::channel(SIGNAL_BUFFER);
        let sink = SignalSink::new(signals.clone());
        let stop = CancellationToken::new();
        let mut detectors = self.detectors;

        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            debug!(target: "marshal::detectors", count = detectors.len(), "detectors started");
            loop {
                tokio::select! {
                    biased;
                    () = task_stop.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        for detector in &mut detectors {
                            detector.observe(&event, &sink);
                        }
                    }
                }
            }
            for detector in &mut detectors {
                detector.shutdown();
            }
            debug!(target: "marshal::detectors", "detectors stopped");
        });

        DetectorHandle {
            events: events_tx,
            signals,
            stop,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Producer-facing side of a running [`DetectorSet`].
#[derive(Clone)]
pub struct DetectorHandle {
    events: mpsc::UnboundedSender<InteractionEvent>,
    signals: broadcast::Sender<DetectorSignal>,
    stop: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DetectorHandle {
    /// Never blocks; events after shutdown are dropped.
    pub fn ingest(&self, event: InteractionEvent) {
        if self.events.send(event).is_err() {
            debug!(target: "marshal::detectors", "event dropped, detectors stopped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectorSignal> {
        self.signals.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Stops evaluation and waits for the detector task to finish. Events
    /// still queued are discarded.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(target: "marshal::detectors", error = %e, "detector task ended abnormally");
            }
        }
    }
}
