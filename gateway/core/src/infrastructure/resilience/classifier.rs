// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Keyword-based failure classification.
//!
//! Classification is a heuristic over the rendered error chain. Typed errors
//! that carry better information (an already-classified failure, a reqwest
//! error, an elapsed tokio timeout) are recognised first; everything else
//! falls through an ordered keyword table. The first matching row wins.

use crate::domain::failure::{ClassifiedError, ErrorCategory};

/// Ordered rules. Status codes are matched as whole tokens only.
const RULES: &[(ErrorCategory, &[&str], &[&str])] = &[
    (
        ErrorCategory::Timeout,
        &["timeout", "timed out", "deadline exceeded", "etimedout"],
        &["408", "504"],
    ),
    (
        ErrorCategory::RateLimit,
        &["rate limit", "rate-limit", "ratelimit", "too many requests", "throttl", "quota exceeded"],
        &["429"],
    ),
    (
        ErrorCategory::Authentication,
        &[
            "unauthorized",
            "unauthenticated",
            "forbidden",
            "authentication",
            "invalid token",
            "token expired",
            "permission denied",
            "invalid credentials",
        ],
        &["401", "403"],
    ),
    (
        ErrorCategory::ResourceExhaustion,
        &[
            "out of memory",
            "no space left",
            "disk full",
            "resource exhausted",
            "too many open files",
            "enospc",
            "enomem",
        ],
        &["507"],
    ),
    (
        ErrorCategory::DependencyUnavailable,
        &["service unavailable", "temporarily unavailable", "bad gateway", "circuit open", "unavailable"],
        &["502", "503"],
    ),
    (
        ErrorCategory::Network,
        &[
            "connection refused",
            "connection reset",
            "connection closed",
            "econnrefused",
            "econnreset",
            "broken pipe",
            "host unreachable",
            "network",
            "dns",
            "error sending request",
        ],
        &[],
    ),
    (
        ErrorCategory::Configuration,
        &["not configured", "misconfigured", "configuration", "missing environment", "relative url"],
        &[],
    ),
    (
        ErrorCategory::Validation,
        &["invalid", "validation", "bad request", "malformed", "schema", "unprocessable", "is required"],
        &["400", "422"],
    ),
];

pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify `error` raised by `operation` against `dependency`.
    pub fn classify(error: &anyhow::Error, operation: &str, dependency: &str) -> ClassifiedError {
        if let Some(classified) = error.downcast_ref::<ClassifiedError>() {
            return classified.clone();
        }

        let message = format!("{:#}", error);
        let category = Self::typed_category(error).unwrap_or_else(|| Self::categorize(&message));
        ClassifiedError::new(category, message, operation, dependency)
    }

    /// Category from the message text alone.
    pub fn categorize(message: &str) -> ErrorCategory {
        let lowered = message.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        RULES
            .iter()
            .find(|(_, keywords, codes)| {
                keywords.iter().any(|k| lowered.contains(k)) || codes.iter().any(|c| tokens.contains(c))
            })
            .map(|(category, _, _)| *category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    fn typed_category(error: &anyhow::Error) -> Option<ErrorCategory> {
        for cause in error.chain() {
            if cause.is::<tokio::time::error::Elapsed>() {
                return Some(ErrorCategory::Timeout);
            }
            if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
                if e.is_timeout() {
                    return Some(ErrorCategory::Timeout);
                }
                if e.is_connect() {
                    return Some(ErrorCategory::Network);
                }
                if e.is_builder() {
                    return Some(ErrorCategory::Configuration);
                }
                if e.is_decode() {
                    return Some(ErrorCategory::Validation);
                }
            }
        }
        None
    }
}
