//! PulseCheck - diagnostic orchestration engine.
//!
//! Continuously probes a remote service endpoint, collects heterogeneous
//! health metrics, and turns them into a ranked root-cause diagnosis with
//! drift detection against historical baselines.
//!
//! The crate is built from four tightly coupled pieces:
//!
//! - [`retry::RetryableCollector`] - retry/backoff wrapper around a single
//!   asynchronous operation, used by every probe.
//! - [`pipeline::EventPipeline`] - bounded, non-blocking event queue that
//!   fans diagnostic events out to pluggable sinks.
//! - [`orchestrator::ProbeOrchestrator`] - runs a set of named probes
//!   concurrently and reduces their results into a single diagnosis.
//! - [`baseline::BaselineEngine`] - captures percentile baselines from
//!   repeated full runs and detects regressions against them.
//!
//! The queries or commands issued against the target service are injected
//! as probe functions; report rendering and CLI parsing live outside this
//! crate and consume its result types through read accessors.

pub mod baseline;
pub mod config;
pub mod endpoint;
pub mod orchestrator;
pub mod pipeline;
pub mod probe;
pub mod retry;

pub use baseline::{
    Baseline, BaselineComparisonResult, BaselineEngine, BaselineError, MetricDelta,
    PercentileTriple, SqliteBaselineStore,
};
pub use config::{DiagnosticsConfig, HealthScoreWeights};
pub use endpoint::EndpointDescriptor;
pub use orchestrator::{
    Diagnosis, DiagnosisCategory, DiagnosticReport, OrchestratorError, ProbeOrchestrator,
    TriageResult,
};
pub use pipeline::{DiagnosticEvent, EventPipeline, PipelineConfig, Severity};
pub use probe::{Probe, ProbeFailure, ProbeRegistry, TestResult};
pub use retry::{CollectorError, RetryPolicy, RetryableCollector};
