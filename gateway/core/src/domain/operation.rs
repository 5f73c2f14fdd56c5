// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cross-Session Operation
//!
//! An [`Operation`] is a unit of work that may affect several sessions and may
//! need their approval before it runs. The payload is a closed set of variants
//! ([`OperationKind`]), each validated when the operation is constructed.
//!
//! ## Approval Policy
//!
//! | Kind | Requires approval |
//! |------|-------------------|
//! | `coordinated_update` | yes |
//! | `approval_gated_action` | yes |
//! | `generation` | no |
//! | `rollback` | yes |
//!
//! ## Status Transitions
//!
//! ```text
//! Pending ──start──▶ InProgress ──complete──▶ Completed
//!    │                   └────────fail──────▶ Failed
//!    ├──cancel──▶ Cancelled
//!    └──fail────▶ Failed
//! ```

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::approval::ApprovalId;
use crate::domain::resource::ResourceRef;
use crate::domain::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Roll a change out across the sessions that share a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatedUpdate {
    pub target: String,
    pub version: String,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
    #[serde(default)]
    pub parameters: Value,
}

/// Run a single tool call, but only after the affected sessions agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalGatedAction {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Produce an artefact (config, manifest, document) from a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub target: String,
    pub template: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

/// Undo previously dispatched work by returning `target` to `to_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollback {
    pub target: String,
    pub to_version: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

/// Kind-specific payload of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum OperationKind {
    CoordinatedUpdate(CoordinatedUpdate),
    ApprovalGatedAction(ApprovalGatedAction),
    Generation(Generation),
    Rollback(Rollback),
}

/// Payload-free discriminant of [`OperationKind`], used for policy lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CoordinatedUpdate,
    ApprovalGatedAction,
    Generation,
    Rollback,
}

impl OperationType {
    /// Static approval policy.
    pub fn requires_approval(self) -> bool {
        match self {
            Self::CoordinatedUpdate | Self::ApprovalGatedAction | Self::Rollback => true,
            Self::Generation => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CoordinatedUpdate => "coordinated_update",
            Self::ApprovalGatedAction => "approval_gated_action",
            Self::Generation => "generation",
            Self::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("invalid operation payload: {0}")]
    InvalidPayload(String),

    #[error("an operation must affect at least one session")]
    NoAffectedSessions,

    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },
}

impl OperationKind {
    /// Build and validate a payload from its wire form (`kind` + JSON payload).
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, OperationError> {
        let tagged = serde_json::json!({ "kind": kind, "payload": payload });
        let parsed: Self = serde_json::from_value(tagged)
            .map_err(|e| OperationError::InvalidPayload(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn operation_type(&self) -> OperationType {
        match self {
            Self::CoordinatedUpdate(_) => OperationType::CoordinatedUpdate,
            Self::ApprovalGatedAction(_) => OperationType::ApprovalGatedAction,
            Self::Generation(_) => OperationType::Generation,
            Self::Rollback(_) => OperationType::Rollback,
        }
    }

    pub fn requires_approval(&self) -> bool {
        self.operation_type().requires_approval()
    }

    /// Shared resources this operation must lock while it executes.
    pub fn resources(&self) -> &[ResourceRef] {
        match self {
            Self::CoordinatedUpdate(p) => &p.resources,
            Self::ApprovalGatedAction(p) => &p.resources,
            Self::Generation(p) => &p.resources,
            Self::Rollback(p) => &p.resources,
        }
    }

    pub fn validate(&self) -> Result<(), OperationError> {
        fn non_empty(field: &str, value: &str) -> Result<(), OperationError> {
            if value.trim().is_empty() {
                return Err(OperationError::InvalidPayload(format!("'{}' cannot be empty", field)));
            }
            Ok(())
        }

        match self {
            Self::CoordinatedUpdate(p) => {
                non_empty("target", &p.target)?;
                non_empty("version", &p.version)?;
            }
            Self::ApprovalGatedAction(p) => {
                non_empty("tool", &p.tool)?;
                if !(p.arguments.is_null() || p.arguments.is_object()) {
                    return Err(OperationError::InvalidPayload(
                        "'arguments' must be an object".to_string(),
                    ));
                }
            }
            Self::Generation(p) => {
                non_empty("target", &p.target)?;
                non_empty("template", &p.template)?;
            }
            Self::Rollback(p) => {
                non_empty("target", &p.target)?;
                non_empty("to_version", &p.to_version)?;
            }
        }

        let mut seen = HashSet::new();
        for resource in self.resources() {
            non_empty("resources[].id", resource.id.as_str())?;
            if !seen.insert(&resource.id) {
                return Err(OperationError::InvalidPayload(format!(
                    "resource '{}' listed more than once",
                    resource.id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    #[serde(flatten)]
    pub kind: OperationKind,
    pub initiator: SessionId,
    /// Never empty.
    pub affected_sessions: BTreeSet<SessionId>,
    pub status: OperationStatus,
    pub requires_approval: bool,
    pub approval_id: Option<ApprovalId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        initiator: SessionId,
        affected_sessions: impl IntoIterator<Item = SessionId>,
    ) -> Result<Self, OperationError> {
        kind.validate()?;
        let affected_sessions: BTreeSet<SessionId> = affected_sessions.into_iter().collect();
        if affected_sessions.is_empty() {
            return Err(OperationError::NoAffectedSessions);
        }

        let now = Utc::now();
        Ok(Self {
            id: OperationId::new(),
            requires_approval: kind.requires_approval(),
            kind,
            initiator,
            affected_sessions,
            status: OperationStatus::Pending,
            approval_id: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            result: None,
            error: None,
        })
    }

    pub fn operation_type(&self) -> OperationType {
        self.kind.operation_type()
    }

    fn transition(&mut self, allowed_from: &[OperationStatus], to: OperationStatus) -> Result<(), OperationError> {
        if !allowed_from.contains(&self.status) {
            return Err(OperationError::InvalidTransition { from: self.status, to });
        }
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), OperationError> {
        self.transition(&[OperationStatus::Pending], OperationStatus::InProgress)
    }

    pub fn complete(&mut self, result: Value) -> Result<(), OperationError> {
        self.transition(&[OperationStatus::InProgress], OperationStatus::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), OperationError> {
        self.transition(
            &[OperationStatus::Pending, OperationStatus::InProgress],
            OperationStatus::Failed,
        )?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), OperationError> {
        self.transition(&[OperationStatus::Pending], OperationStatus::Cancelled)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Whether the operation has been terminal for longer than `retention`.
    pub fn is_expired_for_retention(&self, now: DateTime<Utc>, retention: std::time::Duration) -> bool {
        let Some(finished_at) = self.finished_at else {
            return false;
        };
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        now - finished_at > retention
    }
}
