// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Error Handler
//!
//! Composes classification, retry and circuit breaking around every call to
//! a downstream dependency, and keeps the running health picture.
//!
//! # Composition
//!
//! ```text
//! breaker.try_acquire ──rejected──▶ dependency_unavailable (primary never runs)
//!        │ permit
//!        ▼
//! retry ─▶ attempt ─▶ breaker call timeout ─▶ classify ─▶ record
//!        │
//!        ▼
//! permit settled once with the surfaced outcome
//! ```
//!
//! With circuit breaking disabled the retry engine wraps the call directly.
//! A logical call counts once toward its breaker, so a breaker never opens
//! in the middle of a retry sequence and the surfaced failure is always the
//! last real downstream failure.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Resilience facade used by tool dispatch and the coordinator

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::failure::{ClassifiedError, ErrorCategory};
use crate::domain::gateway_config::ResilienceConfig;
use crate::infrastructure::event_bus::EventBus;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerSettings, CircuitBreakerSnapshot};
use super::classifier::ErrorClassifier;
use super::retry::{RetryExecutor, RetryPolicy};

/// Point-in-time view of dependency health.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthMetrics {
    /// Calls made through `execute`, whatever their outcome
    pub total_calls: u64,
    pub successful_calls: u64,
    /// Calls that surfaced a failure to their caller
    pub failed_calls: u64,
    /// Individual failed attempts, including retried ones and breaker rejections
    pub total_failures: u64,
    pub error_rate: f64,
    /// Mean seconds between recorded failures; `None` below two failures
    pub mtbf_seconds: Option<f64>,
    pub average_latency_ms: f64,
    pub fallback_invocations: u64,
    pub failures_by_category: BTreeMap<ErrorCategory, u64>,
    pub failures_by_dependency: BTreeMap<String, u64>,
    /// Coordination failures (`locked`, `not_lock_holder`, ...) by code
    pub coordination_failures: BTreeMap<String, u64>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct HealthCounters {
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    total_failures: u64,
    total_latency_ms: f64,
    fallback_invocations: u64,
    failures_by_category: BTreeMap<ErrorCategory, u64>,
    failures_by_dependency: BTreeMap<String, u64>,
    coordination_failures: BTreeMap<String, u64>,
    first_failure_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

pub struct ErrorHandler {
    retry: RetryExecutor,
    breaker_enabled: bool,
    breaker_settings: CircuitBreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    history: Mutex<VecDeque<ClassifiedError>>,
    history_capacity: usize,
    counters: Mutex<HealthCounters>,
    event_bus: Option<EventBus>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(&ResilienceConfig::default())
    }
}

impl ErrorHandler {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            retry: RetryExecutor::new(RetryPolicy::from(&config.retry)),
            breaker_enabled: config.circuit_breaker.enabled,
            breaker_settings: CircuitBreakerSettings::from(&config.circuit_breaker),
            breakers: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(config.error_history_capacity)),
            history_capacity: config.error_history_capacity,
            counters: Mutex::new(HealthCounters::default()),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn circuit_breaking_enabled(&self) -> bool {
        self.breaker_enabled
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// The breaker for `dependency`, created on first use.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(dependency) {
            return existing.clone();
        }
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::new(dependency, self.breaker_settings);
                Arc::new(match &self.event_bus {
                    Some(bus) => breaker.with_event_bus(bus.clone()),
                    None => breaker,
                })
            })
            .clone()
    }

    /// Run `primary` against `dependency` with classification, retry and
    /// circuit breaking. `primary` is invoked once per attempt, and not at
    /// all while the dependency's breaker is open.
    pub async fn execute<T, F, Fut>(&self, operation: &str, dependency: &str, mut primary: F) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let shared = self.breaker_enabled.then(|| self.breaker(dependency));
        let breaker = shared.as_deref();

        let permit = match breaker.map(CircuitBreaker::try_acquire).transpose() {
            Ok(permit) => permit,
            Err(rejection) => {
                metrics::counter!("gateway_circuit_rejections_total", "dependency" => dependency.to_string())
                    .increment(1);
                let err = ClassifiedError::new(
                    ErrorCategory::DependencyUnavailable,
                    rejection.to_string(),
                    operation,
                    dependency,
                );
                self.record_failure(&err);
                self.record_call(dependency, false, started.elapsed());
                return Err(err);
            }
        };

        let result = self
            .retry
            .run(operation, |attempt| {
                let call = primary();
                async move {
                    let outcome = match breaker {
                        Some(breaker) => breaker.timed(operation, call).await,
                        None => call.await.map_err(|e| ErrorClassifier::classify(&e, operation, dependency)),
                    };
                    outcome.map_err(|err| {
                        let err = err.with_attempts(attempt);
                        self.record_failure(&err);
                        err
                    })
                }
            })
            .await;

        if let Some(permit) = permit {
            permit.settle(&result);
        }

        let elapsed = started.elapsed();
        self.record_call(dependency, result.is_ok(), elapsed);
        result
    }

    /// Like [`execute`](Self::execute), but on final failure tries `fallback`.
    /// If the fallback also fails, the original failure is returned.
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(
        &self,
        operation: &str,
        dependency: &str,
        primary: F,
        fallback: G,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: FnOnce(ClassifiedError) -> GFut,
        GFut: Future<Output = anyhow::Result<T>>,
    {
        let original = match self.execute(operation, dependency, primary).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        self.counters.lock().fallback_invocations += 1;
        debug!(operation, dependency, "Primary failed, invoking fallback");

        match fallback(original.clone()).await {
            Ok(value) => Ok(value),
            Err(fallback_err) => {
                warn!(
                    operation,
                    dependency,
                    fallback_error = %fallback_err,
                    "Fallback failed, surfacing original failure"
                );
                Err(original)
            }
        }
    }

    /// Record a failure that did not go through `execute` (e.g. schema validation).
    pub fn record_failure(&self, error: &ClassifiedError) {
        metrics::counter!("gateway_errors_total", "category" => error.category.as_str()).increment(1);
        warn!(
            operation = %error.operation,
            dependency = %error.dependency,
            category = %error.category,
            severity = ?error.severity,
            attempt = error.attempts,
            "{}",
            error.message
        );

        {
            let mut counters = self.counters.lock();
            counters.total_failures += 1;
            *counters.failures_by_category.entry(error.category).or_default() += 1;
            *counters
                .failures_by_dependency
                .entry(error.dependency.clone())
                .or_default() += 1;
            counters.first_failure_at.get_or_insert(error.occurred_at);
            counters.last_failure_at = Some(error.occurred_at);
        }

        if self.history_capacity > 0 {
            let mut history = self.history.lock();
            while history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(error.clone());
        }
    }

    /// Record a coordination failure under its stable `code` as well as in
    /// the general history.
    pub fn record_coordination_failure(&self, code: &str, error: &ClassifiedError) {
        metrics::counter!("gateway_coordination_failures_total", "code" => code.to_string()).increment(1);
        *self
            .counters
            .lock()
            .coordination_failures
            .entry(code.to_string())
            .or_default() += 1;
        self.record_failure(error);
    }

    fn record_call(&self, dependency: &str, success: bool, elapsed: std::time::Duration) {
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!("gateway_tool_calls_total", "dependency" => dependency.to_string(), "outcome" => outcome)
            .increment(1);
        metrics::histogram!("gateway_tool_call_duration_seconds", "dependency" => dependency.to_string())
            .record(elapsed.as_secs_f64());

        let mut counters = self.counters.lock();
        counters.total_calls += 1;
        counters.total_latency_ms += elapsed.as_secs_f64() * 1000.0;
        if success {
            counters.successful_calls += 1;
        } else {
            counters.failed_calls += 1;
        }
    }

    /// Most recent failures, newest last.
    pub fn error_history(&self, limit: usize) -> Vec<ClassifiedError> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let c = self.counters.lock();
        let mtbf_seconds = match (c.first_failure_at, c.last_failure_at) {
            (Some(first), Some(last)) if c.total_failures >= 2 => {
                Some((last - first).num_milliseconds() as f64 / 1000.0 / (c.total_failures - 1) as f64)
            }
            _ => None,
        };
        HealthMetrics {
            total_calls: c.total_calls,
            successful_calls: c.successful_calls,
            failed_calls: c.failed_calls,
            total_failures: c.total_failures,
            error_rate: if c.total_calls == 0 {
                0.0
            } else {
                c.failed_calls as f64 / c.total_calls as f64
            },
            mtbf_seconds,
            average_latency_ms: if c.total_calls == 0 {
                0.0
            } else {
                c.total_latency_ms / c.total_calls as f64
            },
            fallback_invocations: c.fallback_invocations,
            failures_by_category: c.failures_by_category.clone(),
            failures_by_dependency: c.failures_by_dependency.clone(),
            coordination_failures: c.coordination_failures.clone(),
            last_failure_at: c.last_failure_at,
        }
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::failure::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config(breaker_enabled: bool) -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.retry.base_delay = Duration::from_millis(10);
        config.retry.max_delay = Duration::from_millis(50);
        config.circuit_breaker.enabled = breaker_enabled;
        config.circuit_breaker.failure_threshold = 2;
        config.error_history_capacity = 4;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_failures_retried_then_surfaced() {
        let handler = ErrorHandler::new(&config(false));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = handler
            .execute("pipeline_trigger", "ci", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("request timed out")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let metrics = handler.health_metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.total_failures, 3);
        assert_eq!(metrics.failures_by_category.get(&ErrorCategory::Timeout), Some(&3));
        assert_eq!(metrics.error_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits() {
        let handler = ErrorHandler::new(&config(true));

        for _ in 0..2 {
            let _: Result<(), _> = handler
                .execute("vm_start", "vm-manager", || async {
                    Err(anyhow::anyhow!("HTTP 503 Service Unavailable"))
                })
                .await;
        }
        assert_eq!(handler.breaker("vm-manager").state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result: Result<(), _> = handler
            .execute("vm_start", "vm-manager", || {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::DependencyUnavailable);
        assert!(err.message.contains("temporarily unavailable"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sequence_counts_once_toward_breaker() {
        let handler = ErrorHandler::new(&config(true));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = handler
            .execute("pipeline_trigger", "ci", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("request timed out")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = handler.breaker("ci").snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_validation_failures_leave_breaker_closed() {
        let handler = ErrorHandler::new(&config(true));
        for _ in 0..5 {
            let result: Result<(), _> = handler
                .execute("git_checkout", "git", || async {
                    Err(anyhow::anyhow!("HTTP 400 Bad Request: invalid branch"))
                })
                .await;
            assert_eq!(result.unwrap_err().category, ErrorCategory::Validation);
        }
        assert_eq!(handler.breaker("git").state(), CircuitState::Closed);

        let other: Result<&str, _> = handler.execute("git_status", "git", || async { Ok("clean") }).await;
        assert_eq!(other.unwrap(), "clean");
    }

    #[tokio::test]
    async fn test_fallback_result_used() {
        let handler = ErrorHandler::new(&config(false));
        let result = handler
            .execute_with_fallback(
                "git_log",
                "git",
                || async { Err::<String, _>(anyhow::anyhow!("HTTP 401 Unauthorized")) },
                |_original| async { Ok("cached".to_string()) },
            )
            .await;
        assert_eq!(result.unwrap(), "cached");
        assert_eq!(handler.health_metrics().fallback_invocations, 1);
    }

    #[tokio::test]
    async fn test_failed_fallback_surfaces_original_error() {
        let handler = ErrorHandler::new(&config(false));
        let result: Result<(), _> = handler
            .execute_with_fallback(
                "git_log",
                "git",
                || async { Err(anyhow::anyhow!("HTTP 401 Unauthorized")) },
                |_original| async { Err(anyhow::anyhow!("fallback store is down")) },
            )
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Authentication);
        assert!(err.message.contains("401"));
    }

    #[tokio::test]
    async fn test_error_history_is_bounded() {
        let handler = ErrorHandler::new(&config(false));
        for i in 0..6 {
            handler.record_failure(&ClassifiedError::new(
                ErrorCategory::Validation,
                format!("bad input {}", i),
                "git_commit",
                "git",
            ));
        }
        let history = handler.error_history(10);
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().unwrap().message, "bad input 5");
        assert_eq!(handler.error_history(1).len(), 1);
        assert!(handler.health_metrics().mtbf_seconds.is_some());
    }
}
