//! Diagnosis rule chain.
//!
//! An ordered, first-match-wins chain over the probe results of one
//! orchestration pass. Rule order encodes severity precedence chosen by
//! operators; confidences are fixed per rule.

use crate::probe::{names, TestResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed classification of a triage outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosisCategory {
    Network,
    Connection,
    Contention,
    ResourceSaturation,
    OperationLatency,
    Healthy,
    Error,
}

impl fmt::Display for DiagnosisCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "Network",
            Self::Connection => "Connection",
            Self::Contention => "Contention",
            Self::ResourceSaturation => "ResourceSaturation",
            Self::OperationLatency => "OperationLatency",
            Self::Healthy => "Healthy",
            Self::Error => "Error",
        };
        write!(f, "{s}")
    }
}

/// Derived classification of a triage pass. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub category: DiagnosisCategory,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub summary: String,
    pub recommendations: Vec<String>,
}

impl Diagnosis {
    fn new(
        category: DiagnosisCategory,
        confidence: f64,
        summary: String,
        recommendations: Vec<&str>,
    ) -> Self {
        Self {
            category,
            confidence: confidence.clamp(0.0, 1.0),
            summary,
            recommendations: recommendations.into_iter().map(String::from).collect(),
        }
    }

    /// Terminal diagnosis for an orchestration-level failure. This is the
    /// only degraded (rather than merely unhealthy) triage outcome.
    pub(crate) fn orchestration_error(message: impl Into<String>) -> Self {
        Self::new(
            DiagnosisCategory::Error,
            1.0,
            message.into(),
            vec![
                "Inspect the diagnostic event log for the failing orchestration step",
                "Re-run the triage; orchestration errors are not probe outcomes",
            ],
        )
    }
}

/// True when the probe either failed outright or flagged soft issues.
fn degraded(result: &TestResult) -> bool {
    !result.success || !result.issues.is_empty()
}

/// What went wrong, phrased from the probe's own reporting.
fn finding(result: &TestResult) -> String {
    if !result.success {
        result.detail.clone()
    } else {
        result.issues.join("; ")
    }
}

/// Apply the rule chain over one pass worth of results. First match wins.
pub(crate) fn diagnose(results: &[TestResult]) -> Diagnosis {
    let find = |name: &str| results.iter().find(|r| r.name == name);

    // 1. Network failure or excessive variance.
    if let Some(network) = find(names::NETWORK) {
        if degraded(network) {
            return Diagnosis::new(
                DiagnosisCategory::Network,
                0.9,
                format!(
                    "Network connectivity to the endpoint is degraded: {}",
                    finding(network)
                ),
                vec![
                    "Check routing, DNS, and packet loss between this host and the endpoint",
                    "Compare latency variance against a known-good baseline capture",
                ],
            );
        }
    }

    // 2. Connection establishment failure.
    if let Some(connection) = find(names::CONNECTION) {
        if !connection.success {
            return Diagnosis::new(
                DiagnosisCategory::Connection,
                0.95,
                format!(
                    "Connections to the endpoint cannot be established: {}",
                    finding(connection)
                ),
                vec![
                    "Verify the service is accepting connections and credentials are valid",
                    "Check connection pool exhaustion and listener backlog on the server",
                ],
            );
        }
    }

    // 3. Active blocking contention.
    if let Some(blocking) = find(names::BLOCKING) {
        if degraded(blocking) {
            return Diagnosis::new(
                DiagnosisCategory::Contention,
                0.85,
                format!("Active blocking detected on the endpoint: {}", finding(blocking)),
                vec![
                    "Identify the head blocker and its open transaction",
                    "Review long-running operations holding locks",
                ],
            );
        }
    }

    // 4. Resource saturation above the critical threshold.
    if let Some(server) = find(names::SERVER) {
        if degraded(server) {
            return Diagnosis::new(
                DiagnosisCategory::ResourceSaturation,
                0.8,
                format!("Endpoint resources are saturated: {}", finding(server)),
                vec![
                    "Check CPU, memory, and IO utilization on the server",
                    "Look for recent workload changes or runaway operations",
                ],
            );
        }
    }

    // 5. Operation latency above threshold.
    if let Some(query) = find(names::QUERY) {
        if degraded(query) {
            return Diagnosis::new(
                DiagnosisCategory::OperationLatency,
                0.75,
                format!("Operations are slower than expected: {}", finding(query)),
                vec![
                    "Inspect execution plans and recent statistics changes",
                    "Compare operation latency against the baseline percentiles",
                ],
            );
        }
    }

    // 6. Everything clean.
    if !results.is_empty() && results.iter().all(|r| r.success && r.issues.is_empty()) {
        return Diagnosis::new(
            DiagnosisCategory::Healthy,
            0.7,
            "All probes passed with no issues".to_string(),
            vec![],
        );
    }

    // Failures outside the canonical probe set (or an empty pass) cannot be
    // classified by the chain.
    let failing: Vec<&str> = results
        .iter()
        .filter(|r| degraded(r))
        .map(|r| r.name.as_str())
        .collect();
    Diagnosis::new(
        DiagnosisCategory::Error,
        0.6,
        format!("Unclassified probe findings: {}", failing.join(", ")),
        vec!["Review the individual probe results for details"],
    )
}
