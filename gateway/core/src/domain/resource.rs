// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shared Resource
//!
//! A named entity (repository, pipeline, environment, ...) that at most one
//! session may hold at a time. Acquisition is fail-fast: a conflicting
//! request is rejected immediately, nothing ever blocks waiting for a lock.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Lock state machine for cross-session resources

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::operation::OperationId;
use crate::domain::session::SessionId;

/// Identifier of a shared resource, e.g. `repo:platform-api` or `env:staging`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Repository,
    Pipeline,
    Environment,
    Container,
    VirtualMachine,
    Infrastructure,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    #[default]
    Exclusive,
}

/// Reference to a resource inside an operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: ResourceId,
    #[serde(default)]
    pub kind: ResourceKind,
}

impl ResourceRef {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: ResourceId::new(id),
            kind,
        }
    }
}

/// Successful lock outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free and is now held by the caller.
    Acquired,
    /// The caller already held the lock; re-locking is idempotent.
    AlreadyHeld,
}

/// The resource is held by another session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("resource '{resource}' is locked by session {holder}")]
pub struct LockConflict {
    pub resource: ResourceId,
    pub holder: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub locked_by: Option<SessionId>,
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    pub access_mode: AccessMode,
    /// Operations waiting on this resource. Informational only.
    pub pending_operations: Vec<OperationId>,
}

impl SharedResource {
    pub fn new(id: ResourceId, kind: ResourceKind, lock_timeout: Duration) -> Self {
        Self {
            id,
            kind,
            locked_by: None,
            locked_at: None,
            lock_timeout,
            access_mode: AccessMode::default(),
            pending_operations: Vec::new(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Check whether `session` could take the lock right now.
    pub fn check_available(&self, session: SessionId) -> Result<(), LockConflict> {
        match self.locked_by {
            Some(holder) if holder != session => Err(LockConflict {
                resource: self.id.clone(),
                holder,
            }),
            _ => Ok(()),
        }
    }

    /// Acquire the lock for `session`. Fails fast if another session holds it.
    pub fn try_lock(
        &mut self,
        session: SessionId,
        mode: AccessMode,
        timeout: Duration,
    ) -> Result<LockOutcome, LockConflict> {
        self.check_available(session)?;

        if self.locked_by == Some(session) {
            return Ok(LockOutcome::AlreadyHeld);
        }

        self.locked_by = Some(session);
        self.locked_at = Some(Utc::now());
        self.access_mode = mode;
        self.lock_timeout = timeout;
        Ok(LockOutcome::Acquired)
    }

    /// Release the lock if `session` holds it. Returns whether it was released.
    pub fn release(&mut self, session: SessionId) -> bool {
        if self.locked_by != Some(session) {
            return false;
        }
        self.force_release();
        true
    }

    pub fn force_release(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }

    /// Whether the current lock has outlived its timeout.
    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        match self.locked_at {
            Some(locked_at) => {
                let timeout = chrono::Duration::from_std(self.lock_timeout)
                    .unwrap_or(chrono::Duration::MAX);
                now - locked_at > timeout
            }
            None => false,
        }
    }

    pub fn enqueue_operation(&mut self, operation: OperationId) {
        if !self.pending_operations.contains(&operation) {
            self.pending_operations.push(operation);
        }
    }

    pub fn dequeue_operation(&mut self, operation: OperationId) {
        self.pending_operations.retain(|id| *id != operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> SharedResource {
        SharedResource::new(
            ResourceId::new("repo:platform-api"),
            ResourceKind::Repository,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn test_lock_is_exclusive_and_fail_fast() {
        let mut r = resource();
        let x = SessionId::new();
        let y = SessionId::new();

        assert_eq!(r.try_lock(x, AccessMode::Exclusive, Duration::from_secs(60)), Ok(LockOutcome::Acquired));
        let err = r.try_lock(y, AccessMode::Exclusive, Duration::from_secs(60)).unwrap_err();
        assert_eq!(err.holder, x);
        assert_eq!(r.locked_by, Some(x));
    }

    #[test]
    fn test_relock_by_holder_is_idempotent() {
        let mut r = resource();
        let x = SessionId::new();
        r.try_lock(x, AccessMode::Write, Duration::from_secs(60)).unwrap();
        assert_eq!(r.try_lock(x, AccessMode::Write, Duration::from_secs(60)), Ok(LockOutcome::AlreadyHeld));
    }

    #[test]
    fn test_only_holder_releases() {
        let mut r = resource();
        let x = SessionId::new();
        let y = SessionId::new();
        r.try_lock(x, AccessMode::Exclusive, Duration::from_secs(60)).unwrap();

        assert!(!r.release(y));
        assert!(r.is_locked());
        assert!(r.release(x));
        assert!(!r.is_locked());
        assert!(r.locked_at.is_none());
    }

    #[test]
    fn test_lock_expiry() {
        let mut r = resource();
        let x = SessionId::new();
        r.try_lock(x, AccessMode::Exclusive, Duration::from_secs(10)).unwrap();

        let now = Utc::now();
        assert!(!r.is_lock_expired(now));
        assert!(r.is_lock_expired(now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn test_pending_queue_has_no_duplicates() {
        let mut r = resource();
        let op = OperationId::new();
        r.enqueue_operation(op);
        r.enqueue_operation(op);
        assert_eq!(r.pending_operations.len(), 1);
        r.dequeue_operation(op);
        assert!(r.pending_operations.is_empty());
    }
}
