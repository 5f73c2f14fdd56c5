// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resilience Layer
//!
//! - Error classification into the failure taxonomy
//! - Retry with exponential backoff and jitter
//! - Per-dependency circuit breaking
//! - Health metrics and error history

pub mod circuit_breaker;
pub mod classifier;
pub mod error_handler;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerSettings, CircuitBreakerSnapshot};
pub use classifier::ErrorClassifier;
pub use error_handler::{ErrorHandler, HealthMetrics};
pub use retry::{RetryExecutor, RetryPolicy};
