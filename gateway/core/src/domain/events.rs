// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::ApprovalId;
use crate::domain::failure::CircuitState;
use crate::domain::operation::{OperationId, OperationType};
use crate::domain::resource::ResourceId;
use crate::domain::session::SessionId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    SessionConnected {
        session_id: SessionId,
        client_id: String,
        connected_at: DateTime<Utc>,
    },
    SessionDisconnected {
        session_id: SessionId,
        disconnected_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationEvent {
    OperationInitiated {
        operation_id: OperationId,
        kind: OperationType,
        initiator: SessionId,
        affected_sessions: usize,
        requires_approval: bool,
        initiated_at: DateTime<Utc>,
    },
    ApprovalRequested {
        approval_id: ApprovalId,
        operation_id: OperationId,
        approvers: Vec<SessionId>,
        expires_at: DateTime<Utc>,
    },
    ApprovalResponded {
        approval_id: ApprovalId,
        operation_id: OperationId,
        session_id: SessionId,
        approved: bool,
        responded_at: DateTime<Utc>,
    },
    ApprovalExpired {
        approval_id: ApprovalId,
        operation_id: OperationId,
        expired_at: DateTime<Utc>,
    },
    OperationStarted {
        operation_id: OperationId,
        started_at: DateTime<Utc>,
    },
    OperationCompleted {
        operation_id: OperationId,
        completed_at: DateTime<Utc>,
    },
    OperationFailed {
        operation_id: OperationId,
        error: String,
        failed_at: DateTime<Utc>,
    },
    OperationCancelled {
        operation_id: OperationId,
        reason: String,
        cancelled_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResourceEvent {
    ResourceLocked {
        resource_id: ResourceId,
        session_id: SessionId,
        locked_at: DateTime<Utc>,
    },
    ResourceReleased {
        resource_id: ResourceId,
        session_id: SessionId,
        /// `released`, `disconnect` or `lock_expired`
        reason: String,
        released_at: DateTime<Utc>,
    },
    LockRejected {
        resource_id: ResourceId,
        requested_by: SessionId,
        held_by: SessionId,
        rejected_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResilienceEvent {
    CircuitStateChanged {
        dependency: String,
        from: CircuitState,
        to: CircuitState,
        changed_at: DateTime<Utc>,
    },
}
