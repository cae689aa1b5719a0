//! Event sinks.
//!
//! Each sink receives every flushed batch; failures are isolated per sink
//! by the pipeline worker. Sinks that write files expose their path through
//! [`EventSink::artifact_path`] so the diagnostic packager can find them
//! without poking at sink internals.

use super::DiagnosticEvent;
use async_trait::async_trait;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Destination for flushed diagnostic event batches.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    /// Filesystem artifact produced by this sink, if any.
    fn artifact_path(&self) -> Option<&Path> {
        None
    }

    async fn flush(
        &self,
        batch: &[DiagnosticEvent],
        cancel: &CancellationToken,
    ) -> Result<(), SinkError>;
}

/// Append-only newline-delimited JSON file sink.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn artifact_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn flush(
        &self,
        batch: &[DiagnosticEvent],
        _cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for event in batch {
            let line = serde_json::to_string(event)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

/// Size-bounded plain-text sink with numbered rotation
/// (`events.log`, `events.log.1`, ... up to `max_files`).
pub struct RotatingFileSink {
    path: PathBuf,
    max_size: u64,
    max_files: usize,
}

impl RotatingFileSink {
    pub fn new(path: impl Into<PathBuf>, max_size: u64, max_files: usize) -> Self {
        Self {
            path: path.into(),
            max_size: max_size.max(1),
            max_files: max_files.max(1),
        }
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.path.display(), index))
    }

    fn rotate_if_needed(&self) -> Result<(), SinkError> {
        let len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if len < self.max_size {
            return Ok(());
        }

        if self.max_files == 1 {
            fs::remove_file(&self.path)?;
            return Ok(());
        }

        let oldest = self.rotated_path(self.max_files - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.max_files - 1).rev() {
            let src = self.rotated_path(index);
            if src.exists() {
                fs::rename(&src, self.rotated_path(index + 1))?;
            }
        }
        fs::rename(&self.path, self.rotated_path(1))?;
        File::create(&self.path)?;
        Ok(())
    }
}

#[async_trait]
impl EventSink for RotatingFileSink {
    fn name(&self) -> &str {
        "rotating_file"
    }

    fn artifact_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    async fn flush(
        &self,
        batch: &[DiagnosticEvent],
        _cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for event in batch {
            writeln!(
                file,
                "{} [{}] {}: {}",
                event.timestamp.to_rfc3339(),
                event.severity,
                event.event_type,
                event.message
            )?;
        }
        drop(file);
        self.rotate_if_needed()
    }
}

/// Mirrors events to the process log via `tracing`.
pub struct ConsoleSink;

#[async_trait]
impl EventSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn flush(
        &self,
        batch: &[DiagnosticEvent],
        _cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        use super::Severity;
        for event in batch {
            match event.severity {
                Severity::Debug => {
                    tracing::debug!(event_type = %event.event_type, "{}", event.message)
                }
                Severity::Info => {
                    tracing::info!(event_type = %event.event_type, "{}", event.message)
                }
                Severity::Warning => {
                    tracing::warn!(event_type = %event.event_type, "{}", event.message)
                }
                Severity::Error => {
                    tracing::error!(event_type = %event.event_type, "{}", event.message)
                }
            }
        }
        Ok(())
    }
}

/// Retains the most recent events in memory, for tests and introspection.
pub struct MemorySink {
    events: Mutex<Vec<DiagnosticEvent>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn snapshot(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn flush(
        &self,
        batch: &[DiagnosticEvent],
        _cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        let mut events = self.events.lock().unwrap();
        events.extend_from_slice(batch);
        if events.len() > self.capacity {
            let excess = events.len() - self.capacity;
            events.drain(..excess);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Severity;
    use tempfile::TempDir;

    fn event(message: &str) -> DiagnosticEvent {
        DiagnosticEvent::new(Severity::Info, "test", message)
    }

    #[tokio::test]
    async fn jsonl_sink_appends_parseable_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::new(&path);
        let cancel = CancellationToken::new();

        sink.flush(&[event("one"), event("two")], &cancel)
            .await
            .unwrap();
        sink.flush(&[event("three")], &cancel).await.unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let parsed: DiagnosticEvent = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.event_type, "test");
        }
        assert_eq!(sink.artifact_path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn rotating_sink_rotates_at_size_cap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.log");
        let sink = RotatingFileSink::new(&path, 256, 3);
        let cancel = CancellationToken::new();

        for n in 0..40 {
            sink.flush(&[event(&format!("message number {n}"))], &cancel)
                .await
                .unwrap();
        }

        assert!(path.exists());
        assert!(sink.rotated_path(1).exists());
        // Current file stays under the cap plus one flush worth of slack.
        assert!(fs::metadata(&path).unwrap().len() < 512);
    }

    #[tokio::test]
    async fn memory_sink_keeps_most_recent() {
        let sink = MemorySink::new(3);
        let cancel = CancellationToken::new();
        sink.flush(
            &[event("1"), event("2"), event("3"), event("4")],
            &cancel,
        )
        .await
        .unwrap();

        let kept = sink.snapshot();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].message, "2");
        assert_eq!(kept[2].message, "4");
    }
}
