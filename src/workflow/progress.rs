//! Run Progress Streaming
//!
//! Event-based progress reporting for the CLI (or any other listener).
//! Events are broadcast; with no subscriber attached they are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::constants::progress::CHANNEL_CAPACITY;
use crate::types::StageStatus;

/// Progress event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageStarted {
        stage: String,
    },
    StageCompleted {
        stage: String,
        status: StageStatus,
        succeeded: usize,
        failed: usize,
        /// Confidence over the analysis stages finished so far
        running_confidence: f64,
    },
    Message {
        level: MessageLevel,
        message: String,
    },
    Finished {
        success: bool,
        total_duration_secs: u64,
        summary: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Snapshot of run progress
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub stages_total: usize,
    pub stages_done: usize,
    pub running: Vec<String>,
    pub running_confidence: f64,
    pub is_running: bool,
}

/// Real-time progress tracker
#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<RwLock<ProgressState>>,
    sender: broadcast::Sender<ProgressEvent>,
    start_time: Arc<RwLock<Option<Instant>>>,
    active: Arc<AtomicBool>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("active", &self.is_active())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(ProgressState::default())),
            sender,
            start_time: Arc::new(RwLock::new(None)),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send an event through the broadcast channel.
    /// Silently discards if no receivers are listening.
    #[inline]
    fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn state(&self) -> ProgressState {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn start(&self, stages_total: usize) {
        self.active.store(true, Ordering::SeqCst);
        *self
            .start_time
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());

        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = ProgressState {
            stages_total,
            is_running: true,
            ..Default::default()
        };
    }

    pub fn stage_started(&self, stage: &str) {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .running
            .push(stage.to_string());
        self.emit(ProgressEvent::StageStarted {
            stage: stage.to_string(),
        });
    }

    pub fn stage_completed(
        &self,
        stage: &str,
        status: StageStatus,
        succeeded: usize,
        failed: usize,
        running_confidence: f64,
    ) {
        {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.running.retain(|s| s != stage);
            state.stages_done += 1;
            state.running_confidence = running_confidence;
        }
        self.emit(ProgressEvent::StageCompleted {
            stage: stage.to_string(),
            status,
            succeeded,
            failed,
            running_confidence,
        });
    }

    pub fn message(&self, level: MessageLevel, message: impl Into<String>) {
        self.emit(ProgressEvent::Message {
            level,
            message: message.into(),
        });
    }

    pub fn finish(&self, success: bool, summary: &str) {
        let duration = self
            .start_time
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);

        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_running = false;
        self.active.store(false, Ordering::SeqCst);

        self.emit(ProgressEvent::Finished {
            success,
            total_duration_secs: duration,
            summary: summary.to_string(),
        });
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
