//! Probe orchestration.
//!
//! Runs every registered probe concurrently, each wrapped in a
//! [`RetryableCollector`], under an overall wall-clock deadline. A slow or
//! failing probe never blocks or cancels the others; probes still running
//! at the deadline are abandoned and recorded as failed timeout results.

mod diagnosis;

pub use diagnosis::*;

use crate::config::{DiagnosticsConfig, HealthScoreWeights};
use crate::endpoint::EndpointDescriptor;
use crate::pipeline::{event_type, DiagnosticEvent, EventPipeline, Severity};
use crate::probe::{names, ProbeFailure, ProbeRegistry, TestResult};
use crate::retry::RetryableCollector;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Metric keys shared between reports and baselines.
pub mod metric_keys {
    /// Fraction of probes that succeeded, in [0, 1].
    pub const SUCCESS_RATE: &str = "success_rate";
    pub const CONNECTION_LATENCY_MS: &str = "connection_latency_ms";
    pub const NETWORK_LATENCY_MS: &str = "network_latency_ms";
    pub const QUERY_LATENCY_MS: &str = "query_latency_ms";
    /// Utilization points in [0, 100], reported by the server probe.
    pub const CPU_UTILIZATION: &str = "cpu_utilization";
    pub const HEALTH_SCORE: &str = "health_score";
    /// Per-probe override: a probe may report its own measured latency
    /// instead of the orchestrator falling back to wall-clock duration.
    pub const LATENCY_MS: &str = "latency_ms";
}

/// Failures that prevent an orchestration pass from starting at all.
/// Everything after start is contained in result objects.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("probe registry is empty")]
    EmptyRegistry,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Aggregate of one orchestration pass. Read-only after return.
#[derive(Debug, Clone, Serialize)]
pub struct TriageResult {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub results: Vec<TestResult>,
    pub diagnosis: Diagnosis,
}

impl TriageResult {
    pub fn result(&self, name: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Fraction of probes that succeeded, in [0, 1].
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        let ok = self.results.iter().filter(|r| r.success).count();
        ok as f64 / self.results.len() as f64
    }
}

/// A full diagnostic run: triage plus extracted metrics and health score.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub endpoint_fingerprint: String,
    pub captured_at: DateTime<Utc>,
    pub triage: TriageResult,
    /// Flat metric table feeding baseline capture and comparison.
    pub metrics: BTreeMap<String, f64>,
    /// 0-100 scalar derived from weighted penalties.
    pub health_score: f64,
}

/// Runs probe sets and reduces their results into a diagnosis.
pub struct ProbeOrchestrator {
    config: DiagnosticsConfig,
    pipeline: EventPipeline,
}

impl ProbeOrchestrator {
    pub fn new(config: DiagnosticsConfig, pipeline: EventPipeline) -> Self {
        Self { config, pipeline }
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    /// Run every probe in `registry` concurrently and reduce the results
    /// into a single ranked diagnosis.
    ///
    /// Cancellation is cooperative: a cancelled pass returns the partial
    /// results collected so far, with the remaining slots marked failed.
    pub async fn run_triage(
        &self,
        endpoint: &Arc<EndpointDescriptor>,
        registry: &ProbeRegistry,
        cancel: &CancellationToken,
    ) -> Result<TriageResult, OrchestratorError> {
        if registry.is_empty() {
            return Err(OrchestratorError::EmptyRegistry);
        }
        self.config
            .probe_retry
            .validate()
            .map_err(OrchestratorError::InvalidConfig)?;

        let started_at = Utc::now();
        let clock = Instant::now();
        self.pipeline.emit(
            DiagnosticEvent::new(
                Severity::Info,
                event_type::TRIAGE_STARTED,
                format!("triage started against {}", endpoint.display_name()),
            )
            .with_payload(json!({ "probes": registry.names() })),
        );

        let order: Vec<String> = registry.iter().map(|p| p.name().to_string()).collect();
        let mut tasks: JoinSet<TestResult> = JoinSet::new();
        for probe in registry.iter() {
            let name = probe.name().to_string();
            let run = probe.runner();
            let endpoint = endpoint.clone();
            let cancel = cancel.clone();
            let collector =
                RetryableCollector::new(self.config.probe_retry.clone(), self.pipeline.clone());

            tasks.spawn(async move {
                let probe_started = Utc::now();
                let probe_clock = Instant::now();
                let outcome = collector
                    .execute(
                        &name,
                        || run(endpoint.clone(), cancel.clone()),
                        ProbeFailure::is_transient,
                        &cancel,
                    )
                    .await;
                match outcome {
                    Ok(mut result) => {
                        // The registry name is authoritative for slot mapping.
                        result.name = name;
                        result
                    }
                    Err(err) => TestResult::failed(
                        &name,
                        err.to_string(),
                        probe_started,
                        probe_clock.elapsed(),
                    ),
                }
            });
        }

        let deadline = tokio::time::sleep(self.config.triage_budget);
        tokio::pin!(deadline);
        let mut results: Vec<TestResult> = Vec::with_capacity(order.len());
        let mut orchestration_error: Option<String> = None;
        let mut timed_out = false;
        let mut cancelled = false;

        while !tasks.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    timed_out = true;
                    drain_aborted(&mut tasks, &mut results).await;
                    break;
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    drain_aborted(&mut tasks, &mut results).await;
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(result)) => results.push(result),
                    Some(Err(join_err)) if join_err.is_panic() => {
                        orchestration_error = Some(format!("probe task panicked: {join_err}"));
                    }
                    Some(Err(_)) | None => {}
                }
            }
        }

        // Abandoned or cancelled probes still occupy their slot.
        for name in &order {
            if results.iter().any(|r| &r.name == name) {
                continue;
            }
            let (detail, issue) = if cancelled {
                ("probe cancelled before completion".to_string(), "cancelled")
            } else {
                (
                    format!(
                        "probe abandoned after {:?} triage budget",
                        self.config.triage_budget
                    ),
                    "timeout",
                )
            };
            results.push(TestResult::failed(name, detail, started_at, clock.elapsed()).with_issue(issue));
        }
        results.sort_by_key(|r| {
            order
                .iter()
                .position(|n| n == &r.name)
                .unwrap_or(usize::MAX)
        });

        let duration = clock.elapsed();
        let diagnosis = match orchestration_error {
            Some(message) => Diagnosis::orchestration_error(message),
            None => diagnose(&results),
        };

        self.pipeline.emit(
            DiagnosticEvent::new(
                Severity::Info,
                event_type::TRIAGE_COMPLETED,
                format!(
                    "triage completed: {} (confidence {:.2})",
                    diagnosis.category, diagnosis.confidence
                ),
            )
            .with_payload(json!({
                "category": diagnosis.category.to_string(),
                "duration_ms": duration.as_secs_f64() * 1000.0,
                "timed_out": timed_out,
                "cancelled": cancelled,
            })),
        );

        Ok(TriageResult {
            started_at,
            duration,
            results,
            diagnosis,
        })
    }

    /// Full diagnostic run: triage plus metric extraction and health score.
    pub async fn run_full(
        &self,
        endpoint: &Arc<EndpointDescriptor>,
        registry: &ProbeRegistry,
        cancel: &CancellationToken,
    ) -> Result<DiagnosticReport, OrchestratorError> {
        let triage = self.run_triage(endpoint, registry, cancel).await?;

        let mut metrics = BTreeMap::new();
        metrics.insert(metric_keys::SUCCESS_RATE.to_string(), triage.success_rate());
        if let Some(r) = triage.result(names::CONNECTION) {
            metrics.insert(metric_keys::CONNECTION_LATENCY_MS.to_string(), latency_ms(r));
        }
        if let Some(r) = triage.result(names::NETWORK) {
            metrics.insert(metric_keys::NETWORK_LATENCY_MS.to_string(), latency_ms(r));
        }
        if let Some(r) = triage.result(names::QUERY) {
            metrics.insert(metric_keys::QUERY_LATENCY_MS.to_string(), latency_ms(r));
        }
        if let Some(utilization) = triage
            .result(names::SERVER)
            .and_then(|r| r.metrics.get(metric_keys::CPU_UTILIZATION))
        {
            metrics.insert(metric_keys::CPU_UTILIZATION.to_string(), *utilization);
        }

        let health_score = health_score(&triage, &self.config.health_weights);
        metrics.insert(metric_keys::HEALTH_SCORE.to_string(), health_score);

        self.pipeline.emit(
            DiagnosticEvent::new(
                Severity::Info,
                event_type::FULL_RUN_COMPLETED,
                format!("full diagnostic run completed, health score {health_score:.1}"),
            )
            .with_payload(json!({
                "health_score": health_score,
                "category": triage.diagnosis.category.to_string(),
            })),
        );

        Ok(DiagnosticReport {
            endpoint_fingerprint: endpoint.fingerprint(),
            captured_at: Utc::now(),
            triage,
            metrics,
            health_score,
        })
    }
}

/// Abort everything still running and keep whatever already finished.
async fn drain_aborted(tasks: &mut JoinSet<TestResult>, results: &mut Vec<TestResult>) {
    tasks.abort_all();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(result) = joined {
            results.push(result);
        }
    }
}

fn latency_ms(result: &TestResult) -> f64 {
    result
        .metrics
        .get(metric_keys::LATENCY_MS)
        .copied()
        .unwrap_or_else(|| result.duration_ms())
}

/// Penalty for one scoring dimension: the worst outcome over its probes.
fn dimension_penalty(triage: &TriageResult, probes: &[&str]) -> f64 {
    probes
        .iter()
        .filter_map(|name| triage.result(name))
        .map(|r| {
            if !r.success {
                1.0
            } else if !r.issues.is_empty() {
                0.5
            } else {
                0.0
            }
        })
        .fold(0.0, f64::max)
}

/// Weighted 0-100 health score. Weights are normalized before use.
pub(crate) fn health_score(triage: &TriageResult, weights: &HealthScoreWeights) -> f64 {
    let w = weights.normalized();
    let penalty = w.connection * dimension_penalty(triage, &[names::NETWORK, names::CONNECTION])
        + w.operation_latency * dimension_penalty(triage, &[names::QUERY])
        + w.resource_saturation * dimension_penalty(triage, &[names::SERVER])
        + w.contention * dimension_penalty(triage, &[names::BLOCKING]);
    (100.0 * (1.0 - penalty)).clamp(0.0, 100.0)
}
