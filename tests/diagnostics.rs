//! End-to-end scenarios for the diagnostic engine: orchestration,
//! diagnosis, event pipeline, and baseline capture/comparison wired
//! together the way a caller would use them.

use chrono::Utc;
use pulsecheck::baseline::{BaselineStore, PercentileTriple, SqliteBaselineStore};
use pulsecheck::orchestrator::metric_keys;
use pulsecheck::pipeline::{event_type, MemorySink};
use pulsecheck::probe::names;
use pulsecheck::{
    BaselineEngine, Diagnosis, DiagnosisCategory, DiagnosticReport, DiagnosticsConfig,
    EndpointDescriptor, EventPipeline, PipelineConfig, Probe, ProbeFailure, ProbeOrchestrator,
    ProbeRegistry, RetryPolicy, TestResult, TriageResult,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> DiagnosticsConfig {
    DiagnosticsConfig {
        triage_budget: Duration::from_secs(5),
        probe_retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Some(Duration::from_millis(5)),
            jitter: 0.0,
        },
        ..DiagnosticsConfig::default()
    }
}

fn endpoint() -> Arc<EndpointDescriptor> {
    Arc::new(EndpointDescriptor::new(
        "test-endpoint",
        "host=db.internal;user=probe;password=secret",
    ))
}

fn passing_probe(name: &'static str) -> Probe {
    Probe::new(name, move |_, _| async move {
        Ok(TestResult::passed(
            name,
            "ok",
            Utc::now(),
            Duration::from_millis(3),
        ))
    })
}

fn failing_probe(name: &'static str, detail: &'static str) -> Probe {
    Probe::new(name, move |_, _| async move {
        Err(ProbeFailure::fatal(detail))
    })
}

fn canonical_registry() -> ProbeRegistry {
    let mut registry = ProbeRegistry::new();
    for name in [
        names::NETWORK,
        names::CONNECTION,
        names::QUERY,
        names::SERVER,
        names::BLOCKING,
    ] {
        registry.register(passing_probe(name)).unwrap();
    }
    registry
}

fn setup() -> (EventPipeline, Arc<MemorySink>, ProbeOrchestrator) {
    init_tracing();
    let sink = Arc::new(MemorySink::new(1000));
    let pipeline = EventPipeline::start(
        PipelineConfig {
            capacity: 1000,
            flush_interval: Duration::from_millis(20),
            batch_threshold: 8,
        },
        vec![sink.clone()],
    );
    let orchestrator = ProbeOrchestrator::new(test_config(), pipeline.clone());
    (pipeline, sink, orchestrator)
}

#[tokio::test]
async fn healthy_end_to_end() {
    let (pipeline, sink, orchestrator) = setup();
    let triage = orchestrator
        .run_triage(&endpoint(), &canonical_registry(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(triage.diagnosis.category, DiagnosisCategory::Healthy);
    assert_eq!(triage.diagnosis.category.to_string(), "Healthy");
    assert!((triage.diagnosis.confidence - 0.7).abs() < 1e-9);
    assert_eq!(triage.results.len(), 5);
    assert!(triage.results.iter().all(|r| r.success));

    pipeline.shutdown().await;
    let events = sink.snapshot();
    assert!(events
        .iter()
        .any(|e| e.event_type == event_type::TRIAGE_COMPLETED));
    assert!(events
        .iter()
        .any(|e| e.event_type == event_type::COLLECTOR_SUCCESS));
}

#[tokio::test]
async fn network_failure_end_to_end() {
    let (pipeline, _sink, orchestrator) = setup();
    let mut registry = ProbeRegistry::new();
    registry
        .register(failing_probe(names::NETWORK, "no route to host"))
        .unwrap();
    for name in [names::CONNECTION, names::QUERY, names::SERVER, names::BLOCKING] {
        registry.register(passing_probe(name)).unwrap();
    }

    let triage = orchestrator
        .run_triage(&endpoint(), &registry, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(triage.diagnosis.category, DiagnosisCategory::Network);
    assert!((triage.diagnosis.confidence - 0.9).abs() < 1e-9);
    assert!(triage.diagnosis.summary.to_lowercase().contains("connectivity"));
    let network = triage.result(names::NETWORK).unwrap();
    assert!(!network.success);
    // Everything else was unaffected.
    assert_eq!(triage.results.iter().filter(|r| r.success).count(), 4);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn probe_isolation() {
    let (pipeline, _sink, orchestrator) = setup();
    let mut registry = ProbeRegistry::new();
    registry.register(failing_probe("alpha", "boom")).unwrap();
    registry.register(passing_probe("beta")).unwrap();

    let triage = orchestrator
        .run_triage(&endpoint(), &registry, &CancellationToken::new())
        .await
        .unwrap();

    let alpha = triage.result("alpha").unwrap();
    let beta = triage.result("beta").unwrap();
    assert!(!alpha.success);
    assert!(beta.success);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn transient_probe_is_retried_to_exhaustion() {
    let (pipeline, sink, orchestrator) = setup();
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_probe = attempts.clone();

    let mut registry = ProbeRegistry::new();
    registry
        .register(Probe::new(names::QUERY, move |_, _| {
            let attempts = attempts_probe.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ProbeFailure::transient("deadlock victim"))
            }
        }))
        .unwrap();

    let triage = orchestrator
        .run_triage(&endpoint(), &registry, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let query = triage.result(names::QUERY).unwrap();
    assert!(!query.success);
    assert!(query.detail.contains("exhausted"));

    pipeline.shutdown().await;
    let events = sink.snapshot();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == event_type::COLLECTOR_RETRY)
            .count(),
        2
    );
    assert!(events
        .iter()
        .any(|e| e.event_type == event_type::COLLECTOR_EXHAUSTED));
}

#[tokio::test]
async fn deadline_abandons_slow_probe() {
    init_tracing();
    let pipeline = EventPipeline::start(PipelineConfig::default(), vec![]);
    let config = DiagnosticsConfig {
        triage_budget: Duration::from_millis(100),
        ..test_config()
    };
    let orchestrator = ProbeOrchestrator::new(config, pipeline.clone());

    let mut registry = ProbeRegistry::new();
    registry.register(passing_probe(names::CONNECTION)).unwrap();
    registry
        .register(Probe::new("glacial", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(TestResult::passed(
                "glacial",
                "ok",
                Utc::now(),
                Duration::ZERO,
            ))
        }))
        .unwrap();

    let triage = orchestrator
        .run_triage(&endpoint(), &registry, &CancellationToken::new())
        .await
        .unwrap();

    assert!(triage.duration < Duration::from_secs(5));
    let fast = triage.result(names::CONNECTION).unwrap();
    assert!(fast.success);
    let slow = triage.result("glacial").unwrap();
    assert!(!slow.success);
    assert!(slow.issues.iter().any(|i| i == "timeout"));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn cancelled_triage_returns_partial_results() {
    let (pipeline, _sink, orchestrator) = setup();
    let cancel = CancellationToken::new();

    let mut registry = ProbeRegistry::new();
    registry.register(passing_probe(names::CONNECTION)).unwrap();
    registry
        .register(Probe::new("patient", |_, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err(ProbeFailure::fatal("interrupted"))
        }))
        .unwrap();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let triage = orchestrator
        .run_triage(&endpoint(), &registry, &cancel)
        .await
        .unwrap();

    assert_eq!(triage.results.len(), 2);
    let fast = triage.result(names::CONNECTION).unwrap();
    assert!(fast.success);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn full_run_extracts_metrics_and_health_score() {
    let (pipeline, _sink, orchestrator) = setup();
    let mut registry = canonical_registry();
    // Replace the server probe with one that reports utilization.
    let mut with_metrics = ProbeRegistry::new();
    for probe in registry.iter() {
        if probe.name() != names::SERVER {
            with_metrics.register(probe.clone()).unwrap();
        }
    }
    with_metrics
        .register(Probe::new(names::SERVER, |_, _| async {
            Ok(TestResult::passed(
                names::SERVER,
                "ok",
                Utc::now(),
                Duration::from_millis(2),
            )
            .with_metric(metric_keys::CPU_UTILIZATION, 35.0))
        }))
        .unwrap();
    registry = with_metrics;

    let report = orchestrator
        .run_full(&endpoint(), &registry, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.metrics[metric_keys::SUCCESS_RATE], 1.0);
    assert_eq!(report.metrics[metric_keys::CPU_UTILIZATION], 35.0);
    assert!(report.metrics.contains_key(metric_keys::CONNECTION_LATENCY_MS));
    assert!(report.metrics.contains_key(metric_keys::NETWORK_LATENCY_MS));
    assert!((report.health_score - 100.0).abs() < 1e-9);
    assert_eq!(report.endpoint_fingerprint, endpoint().fingerprint());
    pipeline.shutdown().await;
}

#[tokio::test]
async fn capture_then_compare_is_clean() {
    let (pipeline, _sink, orchestrator) = setup();
    let engine = BaselineEngine::new(SqliteBaselineStore::in_memory().unwrap(), pipeline.clone());
    let endpoint = endpoint();
    let registry = canonical_registry();
    let cancel = CancellationToken::new();

    let baseline = engine
        .capture(
            &orchestrator,
            &endpoint,
            &registry,
            "nightly",
            3,
            Duration::from_millis(5),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(baseline.sample_count, 3);
    for triple in baseline.metrics.values() {
        assert!(triple.p50 <= triple.p95);
        assert!(triple.p95 <= triple.p99);
    }
    assert_eq!(engine.store().list().unwrap().len(), 1);

    let report = orchestrator
        .run_full(&endpoint, &registry, &cancel)
        .await
        .unwrap();
    let comparison = engine.compare(&report, Some("nightly")).unwrap();
    assert!(comparison.succeeded);
    assert!(!comparison.has_regressions, "{:?}", comparison.notes);
    assert_eq!(comparison.baseline_name.as_deref(), Some("nightly"));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn compare_without_capture_reports_no_baseline() {
    let (pipeline, _sink, orchestrator) = setup();
    let engine = BaselineEngine::new(SqliteBaselineStore::in_memory().unwrap(), pipeline.clone());

    let report = orchestrator
        .run_full(&endpoint(), &canonical_registry(), &CancellationToken::new())
        .await
        .unwrap();
    let comparison = engine.compare(&report, Some("never-captured")).unwrap();

    assert!(!comparison.succeeded);
    assert!(comparison.message.contains("no baseline"));
    assert!(!comparison.has_regressions);
    pipeline.shutdown().await;
}

fn handcrafted_report(metrics: &[(&str, f64)]) -> DiagnosticReport {
    let triage = TriageResult {
        started_at: Utc::now(),
        duration: Duration::from_millis(10),
        results: vec![],
        diagnosis: Diagnosis {
            category: DiagnosisCategory::Healthy,
            confidence: 0.7,
            summary: "All probes passed with no issues".to_string(),
            recommendations: vec![],
        },
    };
    let metrics: BTreeMap<String, f64> = metrics
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
    let health_score = metrics
        .get(metric_keys::HEALTH_SCORE)
        .copied()
        .unwrap_or(100.0);
    DiagnosticReport {
        endpoint_fingerprint: "feedfacecafe0000".to_string(),
        captured_at: Utc::now(),
        triage,
        metrics,
        health_score,
    }
}

fn stored_baseline(name: &str, metrics: &[(&str, f64)]) -> pulsecheck::Baseline {
    pulsecheck::Baseline {
        name: name.to_string(),
        captured_at: Utc::now(),
        machine: "buildhost/linux".to_string(),
        endpoint_fingerprint: "feedfacecafe0000".to_string(),
        sample_count: 5,
        metrics: metrics
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    PercentileTriple {
                        p50: *v,
                        p95: *v,
                        p99: *v,
                    },
                )
            })
            .collect(),
    }
}

#[tokio::test]
async fn success_rate_drop_is_a_regression() {
    init_tracing();
    let pipeline = EventPipeline::start(PipelineConfig::default(), vec![]);
    let store = SqliteBaselineStore::in_memory().unwrap();
    store
        .put(&stored_baseline(
            "prod",
            &[(metric_keys::SUCCESS_RATE, 0.95)],
        ))
        .unwrap();
    let engine = BaselineEngine::new(store, pipeline.clone());

    let report = handcrafted_report(&[(metric_keys::SUCCESS_RATE, 0.80)]);
    let comparison = engine.compare(&report, Some("prod")).unwrap();

    assert!(comparison.succeeded);
    assert!(comparison.has_regressions);
    assert!(comparison
        .notes
        .iter()
        .any(|n| n.contains("success rate")));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn multiple_threshold_breaches_accumulate() {
    init_tracing();
    let pipeline = EventPipeline::start(PipelineConfig::default(), vec![]);
    let store = SqliteBaselineStore::in_memory().unwrap();
    store
        .put(&stored_baseline(
            "prod",
            &[
                (metric_keys::SUCCESS_RATE, 1.0),
                (metric_keys::CONNECTION_LATENCY_MS, 20.0),
                (metric_keys::NETWORK_LATENCY_MS, 5.0),
                (metric_keys::CPU_UTILIZATION, 30.0),
                (metric_keys::HEALTH_SCORE, 100.0),
            ],
        ))
        .unwrap();
    let engine = BaselineEngine::new(store, pipeline.clone());

    let report = handcrafted_report(&[
        (metric_keys::SUCCESS_RATE, 0.60),
        (metric_keys::CONNECTION_LATENCY_MS, 400.0),
        (metric_keys::NETWORK_LATENCY_MS, 80.0),
        (metric_keys::CPU_UTILIZATION, 55.0),
        (metric_keys::HEALTH_SCORE, 58.0),
    ]);
    let comparison = engine.compare(&report, Some("prod")).unwrap();

    assert!(comparison.has_regressions);
    assert_eq!(comparison.notes.len(), 5);
    assert_eq!(comparison.deltas.len(), 5);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn small_drift_is_not_a_regression() {
    init_tracing();
    let pipeline = EventPipeline::start(PipelineConfig::default(), vec![]);
    let store = SqliteBaselineStore::in_memory().unwrap();
    store
        .put(&stored_baseline(
            "prod",
            &[
                (metric_keys::SUCCESS_RATE, 0.98),
                (metric_keys::CONNECTION_LATENCY_MS, 20.0),
            ],
        ))
        .unwrap();
    let engine = BaselineEngine::new(store, pipeline.clone());

    // 2-point drop and 40 ms increase are both under their thresholds.
    let report = handcrafted_report(&[
        (metric_keys::SUCCESS_RATE, 0.96),
        (metric_keys::CONNECTION_LATENCY_MS, 60.0),
    ]);
    let comparison = engine.compare(&report, Some("prod")).unwrap();

    assert!(comparison.succeeded);
    assert!(!comparison.has_regressions);
    assert_eq!(comparison.deltas.len(), 2);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn compare_falls_back_to_fingerprint_match() {
    init_tracing();
    let pipeline = EventPipeline::start(PipelineConfig::default(), vec![]);
    let store = SqliteBaselineStore::in_memory().unwrap();
    store
        .put(&stored_baseline(
            "some-old-name",
            &[(metric_keys::SUCCESS_RATE, 1.0)],
        ))
        .unwrap();
    let engine = BaselineEngine::new(store, pipeline.clone());

    // No name given: resolve through the report's endpoint fingerprint.
    let report = handcrafted_report(&[(metric_keys::SUCCESS_RATE, 1.0)]);
    let comparison = engine.compare(&report, None).unwrap();

    assert!(comparison.succeeded);
    assert_eq!(comparison.baseline_name.as_deref(), Some("some-old-name"));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn empty_registry_refuses_to_start() {
    let (pipeline, _sink, orchestrator) = setup();
    let result = orchestrator
        .run_triage(&endpoint(), &ProbeRegistry::new(), &CancellationToken::new())
        .await;
    assert!(result.is_err());
    pipeline.shutdown().await;
}
