// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Failure Taxonomy
//!
//! Every failure coming back from a downstream collaborator is assigned one
//! [`ErrorCategory`]. The category carries a default [`Severity`] and a default
//! [`RecoveryStrategy`], which decide how the resilience layer reacts.
//!
//! | Category | Severity | Strategy | Max attempts |
//! |----------|----------|----------|--------------|
//! | network | medium | retry | 3 |
//! | timeout | medium | retry | 3 |
//! | authentication | high | fail-fast | 1 |
//! | rate_limit | medium | retry | 5 |
//! | validation | low | fail-fast | 1 |
//! | dependency_unavailable | high | circuit-break | 1 |
//! | resource_exhaustion | critical | circuit-break | 1 |
//! | configuration | critical | fail-fast | 1 |
//! | unknown | medium | retry | 3 |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Authentication,
    RateLimit,
    Validation,
    DependencyUnavailable,
    ResourceExhaustion,
    Configuration,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    FailFast,
    Fallback,
    CircuitBreak,
    Ignore,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        Self::Network,
        Self::Timeout,
        Self::Authentication,
        Self::RateLimit,
        Self::Validation,
        Self::DependencyUnavailable,
        Self::ResourceExhaustion,
        Self::Configuration,
        Self::Unknown,
    ];

    pub fn default_severity(self) -> Severity {
        match self {
            Self::Validation => Severity::Low,
            Self::Network | Self::Timeout | Self::RateLimit | Self::Unknown => Severity::Medium,
            Self::Authentication | Self::DependencyUnavailable => Severity::High,
            Self::ResourceExhaustion | Self::Configuration => Severity::Critical,
        }
    }

    pub fn default_strategy(self) -> RecoveryStrategy {
        match self {
            Self::Network | Self::Timeout | Self::RateLimit | Self::Unknown => RecoveryStrategy::Retry,
            Self::Authentication | Self::Validation | Self::Configuration => RecoveryStrategy::FailFast,
            Self::DependencyUnavailable | Self::ResourceExhaustion => RecoveryStrategy::CircuitBreak,
        }
    }

    pub fn is_retryable(self) -> bool {
        self.default_strategy() == RecoveryStrategy::Retry
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::DependencyUnavailable => "dependency_unavailable",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one dependency's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// A failure after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{category} failure in '{operation}' ({dependency}): {message}")]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub strategy: RecoveryStrategy,
    pub message: String,
    pub operation: String,
    pub dependency: String,
    /// Attempts made before this failure was surfaced.
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

impl ClassifiedError {
    pub fn new(
        category: ErrorCategory,
        message: impl Into<String>,
        operation: impl Into<String>,
        dependency: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity: category.default_severity(),
            strategy: category.default_strategy(),
            message: message.into(),
            operation: operation.into(),
            dependency: dependency.into(),
            attempts: 1,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.strategy == RecoveryStrategy::Retry
    }

    /// Whether this failure says something about the dependency's health.
    /// Caller-side failures (bad input, bad credentials, bad config) do not
    /// count toward a circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(self.strategy, RecoveryStrategy::Retry | RecoveryStrategy::CircuitBreak)
    }
}
