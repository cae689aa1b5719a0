//! Asynchronous diagnostic event pipeline.
//!
//! Producers call [`EventPipeline::emit`], which never blocks: the queue is
//! bounded and evicts its oldest entry to admit the newest under pressure.
//! A single background worker drains the queue on a fixed interval, or
//! immediately once a batch threshold is reached, and hands the same batch
//! to every registered sink. One sink failing never starves the others and
//! never crashes the worker.

mod package;
mod sinks;

pub use package::*;
pub use sinks::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Event-type tags produced by the core.
pub mod event_type {
    pub const COLLECTOR_SUCCESS: &str = "collector_success";
    pub const COLLECTOR_RETRY: &str = "collector_retry";
    pub const COLLECTOR_EXHAUSTED: &str = "collector_exhausted";
    pub const COLLECTOR_FATAL: &str = "collector_fatal";
    pub const COLLECTOR_CANCELLED: &str = "collector_cancelled";
    pub const TRIAGE_STARTED: &str = "triage_started";
    pub const TRIAGE_COMPLETED: &str = "triage_completed";
    pub const FULL_RUN_COMPLETED: &str = "full_run_completed";
    pub const BASELINE_CAPTURED: &str = "baseline_captured";
    pub const BASELINE_COMPARED: &str = "baseline_compared";
}

/// Severity of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A timestamped record of a collector/probe/orchestration occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub event_type: String,
    pub message: String,
    /// Opaque structured payload; sinks persist it as-is.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DiagnosticEvent {
    pub fn new(
        severity: Severity,
        event_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            event_type: event_type.into(),
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Tuning for the event queue and its worker.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum queued events before drop-oldest eviction kicks in.
    pub capacity: usize,
    /// Idle flush cadence of the background worker.
    pub flush_interval: Duration,
    /// Queue depth that triggers an immediate flush.
    pub batch_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            flush_interval: Duration::from_secs(1),
            batch_threshold: 64,
        }
    }
}

struct PipelineShared {
    queue: Mutex<VecDeque<DiagnosticEvent>>,
    capacity: usize,
    batch_threshold: usize,
    dropped: AtomicU64,
    notify: Notify,
}

/// Handle to a running event pipeline. Cheap to clone; all clones share
/// the same queue and worker. Whoever constructs it owns the lifecycle
/// and should call [`EventPipeline::shutdown`] when done.
#[derive(Clone)]
pub struct EventPipeline {
    shared: Arc<PipelineShared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    cancel: CancellationToken,
}

impl EventPipeline {
    /// Start the pipeline and its background worker.
    pub fn start(config: PipelineConfig, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let shared = Arc::new(PipelineShared {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            capacity: config.capacity.max(1),
            batch_threshold: config.batch_threshold.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            shared.clone(),
            sinks,
            config.flush_interval,
            cancel.clone(),
        ));
        Self {
            shared,
            worker: Arc::new(Mutex::new(Some(handle))),
            cancel,
        }
    }

    /// Enqueue an event. Fire-and-forget: never blocks, never fails.
    ///
    /// At capacity the oldest queued entry is evicted to admit this one.
    pub fn emit(&self, event: DiagnosticEvent) {
        let wake = {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    tracing::warn!(dropped, "event queue at capacity, evicting oldest");
                }
            }
            queue.push_back(event);
            queue.len() >= self.shared.batch_threshold
        };
        if wake {
            self.shared.notify.notify_one();
        }
    }

    /// Events currently waiting to be flushed.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Total events evicted under backpressure since start.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stop the worker after one final best-effort flush of the queue.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.shared.queue.lock().unwrap().iter().cloned().collect()
    }
}

async fn run_worker(
    shared: Arc<PipelineShared>,
    sinks: Vec<Arc<dyn EventSink>>,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = shared.notify.notified() => {}
        }

        if flush_once(&shared, &sinks, &cancel).await {
            // A sink misbehaved; back off briefly so a wedged sink cannot
            // spin the worker.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // Final best-effort flush of whatever is still queued.
    let fresh = CancellationToken::new();
    flush_once(&shared, &sinks, &fresh).await;
    tracing::debug!("event pipeline worker stopped");
}

/// Drain the queue and push the batch to every sink in registration order.
/// Returns true if any sink failed.
async fn flush_once(
    shared: &PipelineShared,
    sinks: &[Arc<dyn EventSink>],
    cancel: &CancellationToken,
) -> bool {
    let batch: Vec<DiagnosticEvent> = {
        let mut queue = shared.queue.lock().unwrap();
        if queue.is_empty() {
            return false;
        }
        queue.drain(..).collect()
    };

    let mut failed = false;
    for sink in sinks {
        if let Err(err) = sink.flush(&batch, cancel).await {
            tracing::error!(sink = sink.name(), error = %err, "sink flush failed");
            failed = true;
        }
    }
    failed
}
