// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Notification
//!
//! Server-initiated message addressed to one session. Notifications are
//! queued per target session until delivered (or acknowledged, when the
//! notification asks for it). Delivery is best-effort and at-most-once: a
//! client that reconnects under a new session id does not see notifications
//! addressed to its previous session.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Cross-session notification value object

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::session::SessionId;

/// JSON-RPC method used when a notification is pushed over a transport.
pub const NOTIFICATION_METHOD: &str = "notifications/coordination";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NotificationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequired,
    OperationRejected,
    OperationCompleted,
    OperationFailed,
    OperationCancelled,
    ApprovalExpired,
    ResourceReleased,
}

impl NotificationKind {
    /// Kinds that the receiving client must explicitly acknowledge.
    pub fn requires_ack(self) -> bool {
        matches!(self, Self::ApprovalRequired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub target: SessionId,
    pub source: SessionId,
    pub kind: NotificationKind,
    pub payload: Value,
    pub requires_ack: bool,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(target: SessionId, source: SessionId, kind: NotificationKind, payload: Value) -> Self {
        Self {
            id: NotificationId::new(),
            target,
            source,
            kind,
            payload,
            requires_ack: kind.requires_ack(),
            acknowledged: false,
            created_at: Utc::now(),
        }
    }
}
