// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Approval Gate
//!
//! An [`ApprovalRequest`] collects responses from every required approver of
//! an operation. Responses arrive as independent requests; nothing blocks
//! waiting for them.
//!
//! ## Invariants
//!
//! - At most one response per session.
//! - Only sessions listed in `required_approvers` may respond.
//! - A single rejection finalises the request as `Rejected`, whatever the
//!   other approvers have said or not said yet.
//! - `Approved` requires an approving response from every required approver.
//! - `expires_at` is a fixed wall-clock deadline set at creation.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::operation::{OperationId, OperationType};
use crate::domain::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalId(pub Uuid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ApprovalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_final(self) -> bool {
        self != Self::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub session_id: SessionId,
    pub approved: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("session {0} is not a required approver")]
    NotAnApprover(SessionId),

    #[error("session {0} has already responded")]
    DuplicateResponse(SessionId),

    #[error("approval request is already {0:?}")]
    AlreadyFinalized(ApprovalStatus),

    #[error("approval request expired at {0}")]
    Expired(DateTime<Utc>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub operation_id: OperationId,
    pub kind: OperationType,
    pub required_approvers: BTreeSet<SessionId>,
    /// Arrival order.
    pub responses: Vec<ApprovalResponse>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        operation_id: OperationId,
        kind: OperationType,
        required_approvers: impl IntoIterator<Item = SessionId>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            id: ApprovalId::new(),
            operation_id,
            kind,
            required_approvers: required_approvers.into_iter().collect(),
            responses: Vec::new(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn has_responded(&self, session: SessionId) -> bool {
        self.responses.iter().any(|r| r.session_id == session)
    }

    /// Required approvers that have not answered yet.
    pub fn outstanding_approvers(&self) -> Vec<SessionId> {
        self.required_approvers
            .iter()
            .copied()
            .filter(|s| !self.has_responded(*s))
            .collect()
    }

    /// The first rejecting response, if any.
    pub fn rejection(&self) -> Option<&ApprovalResponse> {
        self.responses.iter().find(|r| !r.approved)
    }

    /// Record one approver's answer and return the resulting status.
    pub fn record_response(
        &mut self,
        session: SessionId,
        approved: bool,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalStatus, ApprovalError> {
        if self.status.is_final() {
            return Err(ApprovalError::AlreadyFinalized(self.status));
        }
        if self.is_expired(now) {
            self.status = ApprovalStatus::Expired;
            return Err(ApprovalError::Expired(self.expires_at));
        }
        if !self.required_approvers.contains(&session) {
            return Err(ApprovalError::NotAnApprover(session));
        }
        if self.has_responded(session) {
            return Err(ApprovalError::DuplicateResponse(session));
        }

        self.responses.push(ApprovalResponse {
            session_id: session,
            approved,
            timestamp: now,
            comment,
        });

        if !approved {
            self.status = ApprovalStatus::Rejected;
        } else if self
            .required_approvers
            .iter()
            .all(|s| self.responses.iter().any(|r| r.session_id == *s && r.approved))
        {
            self.status = ApprovalStatus::Approved;
        }

        Ok(self.status)
    }

    /// Move a pending request to `Expired`. Returns whether it changed.
    pub fn expire(&mut self) -> bool {
        if self.status != ApprovalStatus::Pending {
            return false;
        }
        self.status = ApprovalStatus::Expired;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(approvers: &[SessionId]) -> ApprovalRequest {
        ApprovalRequest::new(
            OperationId::new(),
            OperationType::CoordinatedUpdate,
            approvers.iter().copied(),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_all_approvals_required() {
        let b = SessionId::new();
        let c = SessionId::new();
        let mut req = request(&[b, c]);
        let now = Utc::now();

        assert_eq!(req.record_response(b, true, None, now), Ok(ApprovalStatus::Pending));
        assert_eq!(req.outstanding_approvers(), vec![c]);
        assert_eq!(req.record_response(c, true, None, now), Ok(ApprovalStatus::Approved));
    }

    #[test]
    fn test_single_rejection_short_circuits() {
        let b = SessionId::new();
        let c = SessionId::new();
        let d = SessionId::new();
        let mut req = request(&[b, c, d]);
        let now = Utc::now();

        req.record_response(b, true, None, now).unwrap();
        let status = req
            .record_response(c, false, Some("prod freeze".to_string()), now)
            .unwrap();
        assert_eq!(status, ApprovalStatus::Rejected);
        assert_eq!(req.rejection().unwrap().comment.as_deref(), Some("prod freeze"));

        // d never answered, but the request is final
        assert_eq!(
            req.record_response(d, true, None, now),
            Err(ApprovalError::AlreadyFinalized(ApprovalStatus::Rejected))
        );
    }

    #[test]
    fn test_non_approver_and_duplicates_rejected() {
        let b = SessionId::new();
        let c = SessionId::new();
        let stranger = SessionId::new();
        let mut req = request(&[b, c]);
        let now = Utc::now();

        assert_eq!(
            req.record_response(stranger, true, None, now),
            Err(ApprovalError::NotAnApprover(stranger))
        );
        req.record_response(b, true, None, now).unwrap();
        assert_eq!(
            req.record_response(b, true, None, now),
            Err(ApprovalError::DuplicateResponse(b))
        );
        assert_eq!(req.responses.len(), 1);
    }

    #[test]
    fn test_response_after_deadline_expires_request() {
        let b = SessionId::new();
        let mut req = request(&[b]);
        let late = req.expires_at + chrono::Duration::seconds(1);

        assert!(matches!(req.record_response(b, true, None, late), Err(ApprovalError::Expired(_))));
        assert_eq!(req.status, ApprovalStatus::Expired);
        assert!(req.responses.is_empty());
    }

    #[test]
    fn test_expire_only_pending() {
        let b = SessionId::new();
        let mut req = request(&[b]);
        req.record_response(b, true, None, Utc::now()).unwrap();
        assert!(!req.expire());
        assert_eq!(req.status, ApprovalStatus::Approved);
    }
}
