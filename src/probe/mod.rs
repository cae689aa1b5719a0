//! Probe framework.
//!
//! A probe is a named, idempotent operation measuring one dimension of
//! endpoint health. The actual work (queries, connection attempts) is
//! injected as an async function; the core only owns the result types and
//! the registry handed to the orchestrator.

use crate::endpoint::EndpointDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Canonical probe names recognized by the diagnosis rule chain.
pub mod names {
    /// Network reachability and latency variance.
    pub const NETWORK: &str = "network";
    /// Connection establishment.
    pub const CONNECTION: &str = "connection";
    /// Operation (query) latency.
    pub const QUERY: &str = "query";
    /// Server resource saturation.
    pub const SERVER: &str = "server";
    /// Lock/blocking contention.
    pub const BLOCKING: &str = "blocking";
}

/// Failure of one probe invocation, tagged for the retry classifier.
///
/// Transient failures are retried by the collector; fatal ones propagate
/// on first occurrence. Soft conditions (elevated latency, variance) are
/// not failures at all - they ride on a successful [`TestResult`] as
/// issues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl ProbeFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Registry-level errors; these prevent an orchestration pass from starting.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe '{0}' is already registered")]
    DuplicateName(String),
}

/// Outcome of a single probe invocation.
///
/// Immutable once constructed; owned exclusively by the orchestration pass
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub success: bool,
    pub detail: String,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Soft findings, zero or more. A successful result with issues still
    /// influences the diagnosis rule chain.
    pub issues: Vec<String>,
    /// Numeric measurements feeding health scoring and baselines.
    pub metrics: BTreeMap<String, f64>,
}

impl TestResult {
    pub fn passed(
        name: impl Into<String>,
        detail: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self::build(name, true, detail, started_at, duration)
    }

    pub fn failed(
        name: impl Into<String>,
        detail: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self::build(name, false, detail, started_at, duration)
    }

    fn build(
        name: impl Into<String>,
        success: bool,
        detail: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let ended_at = started_at
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            name: name.into(),
            success,
            detail: detail.into(),
            duration,
            started_at,
            ended_at,
            issues: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

type ProbeFuture = Pin<Box<dyn Future<Output = Result<TestResult, ProbeFailure>> + Send>>;

/// Boxed probe function: endpoint plus cancellation signal in, result out.
pub type ProbeFn =
    Arc<dyn Fn(Arc<EndpointDescriptor>, CancellationToken) -> ProbeFuture + Send + Sync>;

/// A named health measurement against the target endpoint.
#[derive(Clone)]
pub struct Probe {
    name: String,
    run: ProbeFn,
}

impl Probe {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<EndpointDescriptor>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TestResult, ProbeFailure>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |endpoint, cancel| Box::pin(f(endpoint, cancel))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runner(&self) -> ProbeFn {
        self.run.clone()
    }
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe").field("name", &self.name).finish()
    }
}

/// Ordered set of probes for one orchestration pass. Names are unique.
#[derive(Debug, Default, Clone)]
pub struct ProbeRegistry {
    probes: Vec<Probe>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, probe: Probe) -> Result<(), ProbeError> {
        if self.probes.iter().any(|p| p.name == probe.name) {
            return Err(ProbeError::DuplicateName(probe.name));
        }
        self.probes.push(probe);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Probe> {
        self.probes.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_end_time_follows_start() {
        let started = Utc::now();
        let result = TestResult::passed("network", "ok", started, Duration::from_millis(42));
        assert!(result.ended_at >= result.started_at);
        assert!((result.duration_ms() - 42.0).abs() < 0.01);
    }

    #[test]
    fn issues_and_metrics_accumulate() {
        let result = TestResult::passed("server", "ok", Utc::now(), Duration::from_millis(1))
            .with_issue("cpu above critical threshold")
            .with_metric("cpu_utilization", 97.0);
        assert!(result.success);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.metrics.get("cpu_utilization"), Some(&97.0));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = ProbeRegistry::new();
        let make = || {
            Probe::new(names::NETWORK, |_, _| async {
                Ok(TestResult::passed(
                    names::NETWORK,
                    "ok",
                    Utc::now(),
                    Duration::ZERO,
                ))
            })
        };
        registry.register(make()).unwrap();
        assert!(matches!(
            registry.register(make()),
            Err(ProbeError::DuplicateName(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn transient_classification() {
        assert!(ProbeFailure::transient("timeout").is_transient());
        assert!(!ProbeFailure::fatal("bad credentials").is_transient());
    }
}
