//! Retry-aware metric collection.
//!
//! [`RetryableCollector`] wraps a single asynchronous operation with
//! exponential backoff. Only failures the caller classifies as transient
//! are retried; everything else propagates on first occurrence. Every
//! attempt outcome is reported into the event pipeline.

use crate::pipeline::{event_type, DiagnosticEvent, EventPipeline, Severity};
use rand::Rng;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Backoff and attempt limits for one collector.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (must be >= 1).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each attempt after.
    pub base_delay: Duration,
    /// Optional cap on the computed backoff delay.
    pub max_delay: Option<Duration>,
    /// Random jitter fraction added to each backoff delay, in [0, 1].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Some(Duration::from_secs(5)),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be within [0, 1]".to_string());
        }
        Ok(())
    }

    /// Backoff delay before attempt `attempt` (attempt >= 2):
    /// `base_delay * 2^(attempt - 2)`, capped by `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        debug_assert!(attempt >= 2);
        let exponent = attempt.saturating_sub(2).min(32);
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(exponent));
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen::<f64>() * self.jitter;
        delay + delay.mul_f64(factor)
    }
}

/// Terminal outcome of a collector run that produced no value.
#[derive(Debug, Error)]
pub enum CollectorError<E: std::error::Error + 'static> {
    #[error("cancelled during {stage}")]
    Cancelled { stage: &'static str },
    #[error("non-transient failure on attempt {attempt}: {source}")]
    Fatal {
        attempt: u32,
        #[source]
        source: E,
    },
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),
}

/// Generic retry/backoff wrapper around one asynchronous operation.
pub struct RetryableCollector {
    policy: RetryPolicy,
    pipeline: EventPipeline,
}

impl RetryableCollector {
    pub fn new(policy: RetryPolicy, pipeline: EventPipeline) -> Self {
        Self { policy, pipeline }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// `is_transient` decides whether a failure is retried. Cancellation is
    /// observed before each attempt and during backoff sleeps; a cancelled
    /// wait surfaces as [`CollectorError::Cancelled`], never as exhaustion.
    /// On exhaustion the last observed failure is returned.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        name: &str,
        mut operation: F,
        is_transient: C,
        cancel: &CancellationToken,
    ) -> Result<T, CollectorError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::error::Error + 'static,
    {
        self.policy
            .validate()
            .map_err(CollectorError::InvalidPolicy)?;
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1u32;

        loop {
            if attempt >= 2 {
                let delay = self.policy.jittered(self.policy.delay_before(attempt));
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.emit(
                            Severity::Warning,
                            event_type::COLLECTOR_CANCELLED,
                            format!("{name}: cancelled during backoff before attempt {attempt}"),
                            json!({ "collector": name, "attempt": attempt }),
                        );
                        return Err(CollectorError::Cancelled { stage: "backoff" });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if cancel.is_cancelled() {
                self.emit(
                    Severity::Warning,
                    event_type::COLLECTOR_CANCELLED,
                    format!("{name}: cancelled before attempt {attempt}"),
                    json!({ "collector": name, "attempt": attempt }),
                );
                return Err(CollectorError::Cancelled { stage: "attempt" });
            }

            match operation().await {
                Ok(value) => {
                    self.emit(
                        Severity::Info,
                        event_type::COLLECTOR_SUCCESS,
                        format!("{name}: succeeded on attempt {attempt}"),
                        json!({ "collector": name, "attempt": attempt }),
                    );
                    return Ok(value);
                }
                Err(err) if is_transient(&err) => {
                    if attempt >= max_attempts {
                        self.emit(
                            Severity::Error,
                            event_type::COLLECTOR_EXHAUSTED,
                            format!("{name}: exhausted {max_attempts} attempts: {err}"),
                            json!({ "collector": name, "attempts": max_attempts }),
                        );
                        return Err(CollectorError::Exhausted {
                            attempts: max_attempts,
                            source: err,
                        });
                    }
                    self.emit(
                        Severity::Warning,
                        event_type::COLLECTOR_RETRY,
                        format!("{name}: attempt {attempt} failed, retrying: {err}"),
                        json!({
                            "collector": name,
                            "attempt": attempt,
                            "max_attempts": max_attempts,
                        }),
                    );
                    attempt += 1;
                }
                Err(err) => {
                    self.emit(
                        Severity::Error,
                        event_type::COLLECTOR_FATAL,
                        format!("{name}: non-transient failure on attempt {attempt}: {err}"),
                        json!({ "collector": name, "attempt": attempt }),
                    );
                    return Err(CollectorError::Fatal {
                        attempt,
                        source: err,
                    });
                }
            }
        }
    }

    fn emit(&self, severity: Severity, kind: &str, message: String, payload: serde_json::Value) {
        self.pipeline
            .emit(DiagnosticEvent::new(severity, kind, message).with_payload(payload));
    }
}
