//! Baseline capture and regression detection.
//!
//! A baseline is a statistically summarized "known-good" reference built
//! from repeated full diagnostic runs: for every metric the engine keeps
//! a P50/P95/P99 triple computed by rank-based interpolation over the raw
//! samples. Comparison against a baseline applies fixed regression
//! thresholds and accumulates human-readable notes per breach.

mod store;

pub use store::*;

use crate::endpoint::EndpointDescriptor;
use crate::orchestrator::{metric_keys, DiagnosticReport, OrchestratorError, ProbeOrchestrator};
use crate::pipeline::{event_type, DiagnosticEvent, EventPipeline, Severity};
use crate::probe::ProbeRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// Regression thresholds are deliberately fixed: operators compare runs
// across environments and tunable thresholds would make two comparisons
// incomparable.
const SUCCESS_RATE_DROP_PTS: f64 = 5.0;
const CONNECTION_LATENCY_INCREASE_MS: f64 = 100.0;
const NETWORK_LATENCY_INCREASE_MS: f64 = 50.0;
const UTILIZATION_INCREASE_PTS: f64 = 10.0;
const HEALTH_SCORE_DROP_PTS: f64 = 5.0;

/// Rank-based percentile over a sorted sample array:
/// `index = ceil(p * n) - 1`, clamped to `[0, n-1]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let raw = (p * n as f64).ceil() as isize - 1;
    let index = raw.clamp(0, n as isize - 1) as usize;
    sorted[index]
}

/// P50/P95/P99 for one metric. Monotone by construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileTriple {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl PercentileTriple {
    pub fn from_sorted(sorted: &[f64]) -> Self {
        Self {
            p50: percentile(sorted, 0.50),
            p95: percentile(sorted, 0.95),
            p99: percentile(sorted, 0.99),
        }
    }
}

/// A named, immutable capture of known-good metrics. Superseded, never
/// mutated, by later captures under the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub name: String,
    pub captured_at: DateTime<Utc>,
    /// Machine/environment fingerprint of the capturing host.
    pub machine: String,
    /// Hashed endpoint fingerprint; never the raw connection secret.
    pub endpoint_fingerprint: String,
    pub sample_count: u32,
    pub metrics: BTreeMap<String, PercentileTriple>,
}

/// Signed delta of one metric against the baseline's P50.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDelta {
    pub metric: String,
    pub baseline_p50: f64,
    pub current: f64,
    pub delta: f64,
}

/// Outcome of comparing a current report against a baseline.
///
/// A missing baseline is an expected, common outcome: `succeeded` is
/// false and `message` explains, but no error is raised.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineComparisonResult {
    pub succeeded: bool,
    pub message: String,
    pub baseline_name: Option<String>,
    pub deltas: Vec<MetricDelta>,
    pub notes: Vec<String>,
    pub has_regressions: bool,
}

impl BaselineComparisonResult {
    fn no_baseline(name: Option<&str>, fingerprint: &str) -> Self {
        let message = match name {
            Some(name) => format!(
                "no baseline found under name '{name}' or endpoint fingerprint {fingerprint}"
            ),
            None => format!("no baseline found for endpoint fingerprint {fingerprint}"),
        };
        Self {
            succeeded: false,
            message,
            baseline_name: None,
            deltas: Vec::new(),
            notes: Vec::new(),
            has_regressions: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum BaselineError {
    #[error("sample_count must be at least 1")]
    InvalidSampleCount,
    #[error("baseline capture cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Captures baselines from repeated full runs and compares reports
/// against them.
pub struct BaselineEngine<S: BaselineStore> {
    store: S,
    pipeline: EventPipeline,
}

impl<S: BaselineStore> BaselineEngine<S> {
    pub fn new(store: S, pipeline: EventPipeline) -> Self {
        Self { store, pipeline }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `sample_count` full diagnostic passes spaced by
    /// `sample_interval`, summarize every metric into percentile triples,
    /// and persist the result.
    pub async fn capture(
        &self,
        orchestrator: &ProbeOrchestrator,
        endpoint: &Arc<EndpointDescriptor>,
        registry: &ProbeRegistry,
        name: &str,
        sample_count: u32,
        sample_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Baseline, BaselineError> {
        if sample_count == 0 {
            return Err(BaselineError::InvalidSampleCount);
        }

        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for pass in 0..sample_count {
            if pass > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BaselineError::Cancelled),
                    _ = tokio::time::sleep(sample_interval) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(BaselineError::Cancelled);
            }
            let report = orchestrator.run_full(endpoint, registry, cancel).await?;
            for (key, value) in &report.metrics {
                samples.entry(key.clone()).or_default().push(*value);
            }
        }

        let metrics = samples
            .into_iter()
            .map(|(key, mut values)| {
                values.sort_by(|a, b| a.total_cmp(b));
                (key, PercentileTriple::from_sorted(&values))
            })
            .collect();

        let baseline = Baseline {
            name: name.to_string(),
            captured_at: Utc::now(),
            machine: machine_fingerprint(),
            endpoint_fingerprint: endpoint.fingerprint(),
            sample_count,
            metrics,
        };
        self.store.put(&baseline)?;

        self.pipeline.emit(
            DiagnosticEvent::new(
                Severity::Info,
                event_type::BASELINE_CAPTURED,
                format!("baseline '{name}' captured from {sample_count} samples"),
            )
            .with_payload(json!({
                "name": name,
                "endpoint_fingerprint": baseline.endpoint_fingerprint,
                "sample_count": sample_count,
            })),
        );

        Ok(baseline)
    }

    /// Compare a current report against a stored baseline.
    ///
    /// Resolution: most recent capture under `name` when given, else the
    /// most recent capture matching the report's endpoint fingerprint.
    /// No match is reported through the result, not as an error.
    pub fn compare(
        &self,
        current: &DiagnosticReport,
        name: Option<&str>,
    ) -> Result<BaselineComparisonResult, BaselineError> {
        let mut resolved = match name {
            Some(name) => self.store.latest_by_name(name)?,
            None => None,
        };
        if resolved.is_none() {
            resolved = self
                .store
                .latest_by_fingerprint(&current.endpoint_fingerprint)?;
        }
        let Some(baseline) = resolved else {
            return Ok(BaselineComparisonResult::no_baseline(
                name,
                &current.endpoint_fingerprint,
            ));
        };

        let mut result = BaselineComparisonResult {
            succeeded: true,
            message: format!(
                "compared against baseline '{}' captured {}",
                baseline.name,
                baseline.captured_at.to_rfc3339()
            ),
            baseline_name: Some(baseline.name.clone()),
            deltas: Vec::new(),
            notes: Vec::new(),
            has_regressions: false,
        };

        for (key, triple) in &baseline.metrics {
            let Some(current_value) = current.metrics.get(key).copied() else {
                continue;
            };
            let delta = current_value - triple.p50;
            result.deltas.push(MetricDelta {
                metric: key.clone(),
                baseline_p50: triple.p50,
                current: current_value,
                delta,
            });

            match key.as_str() {
                metric_keys::SUCCESS_RATE => {
                    let drop_pts = -delta * 100.0;
                    if drop_pts > SUCCESS_RATE_DROP_PTS {
                        result.notes.push(format!(
                            "success rate dropped {:.1} points (baseline {:.1}%, current {:.1}%)",
                            drop_pts,
                            triple.p50 * 100.0,
                            current_value * 100.0
                        ));
                    }
                }
                metric_keys::CONNECTION_LATENCY_MS => {
                    if delta > CONNECTION_LATENCY_INCREASE_MS {
                        result.notes.push(format!(
                            "connection latency increased {delta:.0} ms over baseline ({:.0} ms -> {:.0} ms)",
                            triple.p50, current_value
                        ));
                    }
                }
                metric_keys::NETWORK_LATENCY_MS => {
                    if delta > NETWORK_LATENCY_INCREASE_MS {
                        result.notes.push(format!(
                            "network latency increased {delta:.0} ms over baseline ({:.0} ms -> {:.0} ms)",
                            triple.p50, current_value
                        ));
                    }
                }
                metric_keys::CPU_UTILIZATION => {
                    if delta > UTILIZATION_INCREASE_PTS {
                        result.notes.push(format!(
                            "cpu utilization increased {delta:.1} points over baseline ({:.1} -> {:.1})",
                            triple.p50, current_value
                        ));
                    }
                }
                metric_keys::HEALTH_SCORE => {
                    let drop_pts = -delta;
                    if drop_pts > HEALTH_SCORE_DROP_PTS {
                        result.notes.push(format!(
                            "health score dropped {drop_pts:.1} points (baseline {:.1}, current {:.1})",
                            triple.p50, current_value
                        ));
                    }
                }
                _ => {}
            }
        }
        result.has_regressions = !result.notes.is_empty();

        self.pipeline.emit(
            DiagnosticEvent::new(
                if result.has_regressions {
                    Severity::Warning
                } else {
                    Severity::Info
                },
                event_type::BASELINE_COMPARED,
                format!(
                    "baseline comparison against '{}': {} regression note(s)",
                    baseline.name,
                    result.notes.len()
                ),
            )
            .with_payload(json!({
                "baseline": baseline.name,
                "has_regressions": result.has_regressions,
            })),
        );

        Ok(result)
    }
}

/// Host identity recorded into captures: `hostname/os`.
fn machine_fingerprint() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{host}/{}", std::env::consts::OS)
}
