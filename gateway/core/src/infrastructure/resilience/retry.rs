// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Retry with exponential backoff and symmetric jitter.
//!
//! The delay before attempt `n + 1` is `base × multiplier^(n-1)`, clamped to
//! `max_delay`, then scaled by a random factor in `[1 - jitter, 1 + jitter]`.
//! Categories whose default strategy is not `retry` stop after the first
//! attempt.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::domain::failure::{ClassifiedError, ErrorCategory};
use crate::domain::gateway_config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: f64,
    pub category_overrides: HashMap<ErrorCategory, u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            multiplier: config.multiplier.max(1.0),
            max_delay: config.max_delay,
            jitter: config.jitter.clamp(0.0, 0.99),
            category_overrides: config.category_overrides.clone(),
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed for a failure of `category`.
    pub fn max_attempts_for(&self, category: ErrorCategory) -> u32 {
        if !category.is_retryable() {
            return 1;
        }
        self.category_overrides
            .get(&category)
            .copied()
            .unwrap_or(self.max_attempts)
            .max(1)
    }

    /// Backoff after failed attempt `attempt` (1-based), before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Backoff after failed attempt `attempt`, with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        nominal.mul_f64(factor)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds or its failure category runs out of
    /// attempts. The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, ClassifiedError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let mut n = 1;
        loop {
            match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let limit = self.policy.max_attempts_for(err.category);
                    if n >= limit {
                        return Err(err.with_attempts(n));
                    }
                    let delay = self.policy.delay_for(n);
                    warn!(
                        operation,
                        attempt = n,
                        max_attempts = limit,
                        category = %err.category,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after failure: {}",
                        err.message
                    );
                    tokio::time::sleep(delay).await;
                    n += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
            jitter: 0.25,
            category_overrides: HashMap::from([(ErrorCategory::RateLimit, 5)]),
        }
    }

    #[test]
    fn test_nominal_delay_grows_and_clamps() {
        let p = policy();
        assert_eq!(p.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(p.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(p.nominal_delay(3), Duration::from_millis(350));
        assert_eq!(p.nominal_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let p = policy();
        for attempt in 1..=4 {
            let nominal = p.nominal_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = p.delay_for(attempt).as_secs_f64();
                assert!(d >= nominal * 0.75 - 1e-9 && d <= nominal * 1.25 + 1e-9);
            }
        }
    }

    #[test]
    fn test_attempt_limits_per_category() {
        let p = policy();
        assert_eq!(p.max_attempts_for(ErrorCategory::Timeout), 3);
        assert_eq!(p.max_attempts_for(ErrorCategory::RateLimit), 5);
        assert_eq!(p.max_attempts_for(ErrorCategory::Authentication), 1);
        assert_eq!(p.max_attempts_for(ErrorCategory::Validation), 1);
        assert_eq!(p.max_attempts_for(ErrorCategory::DependencyUnavailable), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_stop_after_three_attempts() {
        let executor = RetryExecutor::new(policy());
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .run("git_fetch", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClassifiedError::new(ErrorCategory::Timeout, "timed out", "git_fetch", "git")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_is_never_retried() {
        let executor = RetryExecutor::new(policy());
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .run("git_commit", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ClassifiedError::new(ErrorCategory::Validation, "bad", "git_commit", "git")) }
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_later_attempt() {
        let executor = RetryExecutor::new(policy());
        let result = executor
            .run("pipeline_status", |n| async move {
                if n < 2 {
                    Err(ClassifiedError::new(ErrorCategory::Network, "connection reset", "pipeline_status", "ci"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }
}
