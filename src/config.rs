//! Configuration for the diagnostic engine.
//!
//! Loads from environment variables with sensible defaults, mirroring the
//! deployment style of the surrounding tooling.

use crate::pipeline::PipelineConfig;
use crate::retry::RetryPolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Weighted penalties feeding the 0-100 health score.
///
/// The defaults reproduce the historical weighting (40% on the connection
/// dimension) but are deliberately configurable: the historical values
/// carry no stated justification and are pending product review.
#[derive(Debug, Clone)]
pub struct HealthScoreWeights {
    pub connection: f64,
    pub operation_latency: f64,
    pub resource_saturation: f64,
    pub contention: f64,
}

impl Default for HealthScoreWeights {
    fn default() -> Self {
        Self {
            connection: 0.40,
            operation_latency: 0.25,
            resource_saturation: 0.20,
            contention: 0.15,
        }
    }
}

impl HealthScoreWeights {
    /// Normalize weights so they sum to 1.0.
    pub fn normalized(&self) -> Self {
        let sum =
            self.connection + self.operation_latency + self.resource_saturation + self.contention;
        if sum <= 0.0 {
            return Self::default();
        }
        Self {
            connection: self.connection / sum,
            operation_latency: self.operation_latency / sum,
            resource_saturation: self.resource_saturation / sum,
            contention: self.contention / sum,
        }
    }
}

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Total wall-clock budget for one triage pass (default: 30s).
    pub triage_budget: Duration,
    /// Retry policy applied to every probe.
    pub probe_retry: RetryPolicy,
    /// Event queue and worker tuning.
    pub pipeline: PipelineConfig,
    /// Directory where file sinks write their artifacts.
    pub log_dir: PathBuf,
    /// Health score penalty weights.
    pub health_weights: HealthScoreWeights,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            triage_budget: Duration::from_secs(30),
            probe_retry: RetryPolicy::default(),
            pipeline: PipelineConfig::default(),
            log_dir: PathBuf::from("pulsecheck-logs"),
            health_weights: HealthScoreWeights::default(),
        }
    }
}

impl DiagnosticsConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PULSECHECK_TRIAGE_BUDGET_MS`: triage wall-clock budget (default: 30000)
    /// - `PULSECHECK_MAX_ATTEMPTS`: probe retry attempts (default: 3)
    /// - `PULSECHECK_BASE_DELAY_MS`: first retry backoff (default: 200)
    /// - `PULSECHECK_QUEUE_CAPACITY`: event queue capacity (default: 1024)
    /// - `PULSECHECK_FLUSH_INTERVAL_MS`: pipeline flush cadence (default: 1000)
    /// - `PULSECHECK_BATCH_THRESHOLD`: immediate-flush batch size (default: 64)
    /// - `PULSECHECK_LOG_DIR`: sink artifact directory (default: "pulsecheck-logs")
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = env_u64("PULSECHECK_TRIAGE_BUDGET_MS") {
            cfg.triage_budget = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_u64("PULSECHECK_MAX_ATTEMPTS") {
            cfg.probe_retry.max_attempts = attempts.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = env_u64("PULSECHECK_BASE_DELAY_MS") {
            cfg.probe_retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(capacity) = env_u64("PULSECHECK_QUEUE_CAPACITY") {
            cfg.pipeline.capacity = capacity as usize;
        }
        if let Some(ms) = env_u64("PULSECHECK_FLUSH_INTERVAL_MS") {
            cfg.pipeline.flush_interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_u64("PULSECHECK_BATCH_THRESHOLD") {
            cfg.pipeline.batch_threshold = threshold as usize;
        }
        if let Ok(dir) = env::var("PULSECHECK_LOG_DIR") {
            cfg.log_dir = PathBuf::from(dir);
        }

        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok()?.parse().ok()
}
