// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Per-dependency circuit breaker.
//!
//! ```text
//! Closed ──F consecutive failures──▶ Open ──cool-down elapsed──▶ HalfOpen
//!   ▲                                  ▲                           │
//!   └──────────── probe success ───────┼───────────────────────────┤
//!                                      └──── probe failure ────────┘
//! ```
//!
//! While `Open`, calls are rejected without invoking the wrapped function.
//! `HalfOpen` admits exactly one probe; everything else is rejected until the
//! probe settles. Only failures that reflect on the dependency count toward
//! the threshold (see [`ClassifiedError::trips_breaker`]); a rejected request
//! leaves the breaker where it was.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::domain::events::ResilienceEvent;
use crate::domain::failure::{CircuitState, ClassifiedError, ErrorCategory};
use crate::domain::gateway_config::CircuitBreakerConfig;
use crate::infrastructure::event_bus::EventBus;

use super::classifier::ErrorClassifier;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub cool_down: Duration,
    pub call_timeout: Duration,
}

impl From<&CircuitBreakerConfig> for CircuitBreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cool_down: config.cool_down,
            call_timeout: config.call_timeout,
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("circuit open for '{0}': dependency temporarily unavailable")]
    Open(String),

    #[error(transparent)]
    Failed(ClassifiedError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    rejected_calls: u64,
}

pub struct CircuitBreaker {
    dependency: String,
    settings: CircuitBreakerSettings,
    inner: Mutex<BreakerInner>,
    event_bus: Option<EventBus>,
}

/// Admission ticket for one call. Dropping it unsettled (the call future was
/// cancelled) frees the half-open probe slot without counting an outcome.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }

    /// Give the permit back without recording an outcome.
    pub fn release(mut self) {
        self.settled = true;
        if self.probe {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }

    /// Settle according to `outcome`.
    pub fn settle<T>(self, outcome: &Result<T, ClassifiedError>) {
        match outcome {
            Ok(_) => self.success(),
            Err(err) if err.trips_breaker() => self.failure(),
            Err(err) => {
                tracing::debug!(
                    dependency = %self.breaker.dependency,
                    category = %err.category,
                    "Failure not counted toward circuit breaker"
                );
                self.release();
            }
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, settings: CircuitBreakerSettings) -> Self {
        Self {
            dependency: dependency.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                probe_in_flight: false,
                rejected_calls: 0,
            }),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to make a call. Moves `Open` to `HalfOpen` once the cool-down has elapsed.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitBreakerError> {
        let mut inner = self.inner.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.settings.cool_down)
                    .unwrap_or(true);
                if !cooled {
                    inner.rejected_calls += 1;
                    return Err(CircuitBreakerError::Open(self.dependency.clone()));
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.rejected_calls += 1;
                    return Err(CircuitBreakerError::Open(self.dependency.clone()));
                }
                inner.probe_in_flight = true;
                true
            }
        };

        Ok(CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Run one call under the breaker. `call` is only invoked once a permit
    /// has been granted.
    pub async fn call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let permit = self.try_acquire()?;
        let outcome = self.timed(operation, call()).await;
        permit.settle(&outcome);
        outcome.map_err(CircuitBreakerError::Failed)
    }

    /// Await `call` with the configured call timeout and classify its failure.
    pub async fn timed<T, Fut>(&self, operation: &str, call: Fut) -> Result<T, ClassifiedError>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ErrorClassifier::classify(&e, operation, &self.dependency)),
            Err(_) => Err(ClassifiedError::new(
                ErrorCategory::Timeout,
                format!(
                    "call to '{}' timed out after {:?}",
                    self.dependency, self.settings.call_timeout
                ),
                operation,
                self.dependency.clone(),
            )),
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            dependency: self.dependency.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            rejected_calls: inner.rejected_calls,
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        inner.opened_at = None;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Utc::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.settings.failure_threshold => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => warn!(
                dependency = %self.dependency,
                consecutive_failures = inner.consecutive_failures,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(dependency = %self.dependency, "Circuit breaker half-open, allowing probe"),
            CircuitState::Closed => info!(dependency = %self.dependency, "Circuit breaker closed"),
        }
        if let Some(bus) = &self.event_bus {
            bus.publish_resilience_event(ResilienceEvent::CircuitStateChanged {
                dependency: self.dependency.clone(),
                from,
                to,
                changed_at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "ci",
            CircuitBreakerSettings {
                failure_threshold: 3,
                cool_down: Duration::from_secs(60),
                call_timeout: Duration::from_secs(5),
            },
        )
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .call("vm_start", || async { Err::<(), _>(anyhow::anyhow!("HTTP 503 Service Unavailable")) })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = b
            .call("vm_start", || {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(b.snapshot().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_probe() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let probe = b.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.try_acquire(), Err(CircuitBreakerError::Open(_))));

        probe.success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(b.try_acquire(), Err(CircuitBreakerError::Open(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_slot() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let b = breaker();
        let result = b
            .call("vm_start", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Failed(ref e)) if e.category == ErrorCategory::Timeout));
        assert_eq!(b.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker();
        fail(&b).await;
        fail(&b).await;
        b.call("vm_start", || async { Ok(()) }).await.unwrap();
        fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_rejected_requests_do_not_open_breaker() {
        let b = breaker();
        for _ in 0..5 {
            let result = b
                .call("git_checkout", || async {
                    Err::<(), _>(anyhow::anyhow!("HTTP 400 Bad Request: invalid branch"))
                })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Failed(ref e)) if e.category == ErrorCategory::Validation));
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
        assert!(b.call("git_status", || async { Ok(()) }).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_probe_keeps_half_open() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let _ = b
            .call("vm_start", || async { Err::<(), _>(anyhow::anyhow!("HTTP 401 Unauthorized")) })
            .await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire().unwrap().is_probe());
    }
}
