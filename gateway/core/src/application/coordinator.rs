// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Cross-Session Coordinator
//!
//! Sequences operations that affect more than one session: approval gates,
//! fail-fast exclusive locking of shared resources, dispatch to the external
//! collaborators and notification of every affected session.
//!
//! Approvals never block. An operation that needs approval parks in the
//! `pending` state and is driven forward by independently arriving
//! [`process_approval_response`](CrossSessionCoordinator::process_approval_response)
//! calls, by the sweep (expiry) or by its initiator disconnecting.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Multi-session operation lifecycle and resource ownership
//!
//! All coordinator state sits behind one lock that is never held across an
//! `.await`. Notifications are collected under the lock and delivered after
//! it is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::coordination_sweeper::CoordinationSweeper;
use crate::application::session_registry::{RegistryError, SessionLifecycleListener, SessionRegistry};
use crate::application::tool_invocation_service::{ToolInvocationError, ToolInvocationService};
use crate::domain::approval::{ApprovalError, ApprovalId, ApprovalRequest, ApprovalStatus};
use crate::domain::collaborators::{GENERATION_SERVICE, ROLLBACK_MANAGER, UPDATE_ORCHESTRATOR};
use crate::domain::events::{OperationEvent, ResourceEvent};
use crate::domain::failure::{ClassifiedError, ErrorCategory};
use crate::domain::gateway_config::CoordinationConfig;
use crate::domain::notification::{Notification, NotificationKind};
use crate::domain::operation::{Operation, OperationError, OperationId, OperationKind, OperationStatus};
use crate::domain::resource::{AccessMode, LockConflict, LockOutcome, ResourceId, ResourceKind, SharedResource};
use crate::domain::session::SessionId;
use crate::infrastructure::collaborators::Collaborators;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::resilience::ErrorHandler;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error(transparent)]
    InvalidOperation(#[from] OperationError),

    #[error("session {0} is not registered")]
    UnknownSession(SessionId),

    #[error("operation {0} not found")]
    OperationNotFound(OperationId),

    #[error("approval request {0} not found")]
    ApprovalNotFound(ApprovalId),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("locked: {0}")]
    Locked(#[from] LockConflict),

    #[error("session {session} does not hold the lock on '{resource}'")]
    NotLockHolder { resource: ResourceId, session: SessionId },

    #[error("resource '{0}' not found")]
    ResourceNotFound(ResourceId),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("session {0} closes after this request and cannot wait for approvals; initialize a session first")]
    EphemeralInitiator(SessionId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Execution(#[from] ClassifiedError),
}

impl CoordinationError {
    /// Stable machine-readable code carried in tool failures.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidOperation(_) => "invalid_operation",
            Self::UnknownSession(_) => "unknown_session",
            Self::OperationNotFound(_) => "operation_not_found",
            Self::ApprovalNotFound(_) => "approval_not_found",
            Self::Approval(ApprovalError::Expired(_)) => "approval_expired",
            Self::Approval(_) => "invalid_approval_response",
            Self::Locked(_) => "locked",
            Self::NotLockHolder { .. } => "not_lock_holder",
            Self::ResourceNotFound(_) => "resource_not_found",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::EphemeralInitiator(_) => "ephemeral_session",
            Self::Registry(_) => "session_unavailable",
            Self::Execution(_) => "execution_failed",
        }
    }
}

/// What `initiate_operation` reports back to the initiator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateOutcome {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<ApprovalId>,
    pub approvers: Vec<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// What `process_approval_response` reports back to the responder.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub approval_id: ApprovalId,
    pub operation_id: OperationId,
    pub approval_status: ApprovalStatus,
    pub operation_status: OperationStatus,
    pub outstanding_approvers: Vec<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_approvals: usize,
    pub purged_operations: usize,
    pub released_locks: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_approvals == 0 && self.purged_operations == 0 && self.released_locks == 0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OperationCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub operations: OperationCounts,
    pub pending_approvals: usize,
    pub tracked_resources: usize,
    pub locked_resources: usize,
}

#[derive(Default)]
struct CoordinatorState {
    operations: HashMap<OperationId, Operation>,
    approvals: HashMap<ApprovalId, ApprovalRequest>,
    resources: BTreeMap<ResourceId, SharedResource>,
}

impl CoordinatorState {
    fn dequeue_everywhere(&mut self, operation_id: OperationId) {
        for resource in self.resources.values_mut() {
            resource.dequeue_operation(operation_id);
        }
    }

    /// `ResourceReleased` for the initiators of pending operations queued on `resource`.
    fn release_notifications(&self, resource: &SharedResource, released_by: SessionId, reason: &str) -> Vec<Notification> {
        resource
            .pending_operations
            .iter()
            .filter_map(|id| self.operations.get(id))
            .filter(|op| op.status == OperationStatus::Pending && op.initiator != released_by)
            .map(|op| {
                Notification::new(
                    op.initiator,
                    released_by,
                    NotificationKind::ResourceReleased,
                    json!({
                        "resourceId": resource.id,
                        "operationId": op.id,
                        "reason": reason,
                    }),
                )
            })
            .collect()
    }
}

struct SweepTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CrossSessionCoordinator {
    registry: Arc<SessionRegistry>,
    tools: Arc<ToolInvocationService>,
    error_handler: Arc<ErrorHandler>,
    collaborators: Collaborators,
    config: CoordinationConfig,
    state: RwLock<CoordinatorState>,
    event_bus: EventBus,
    sweep: Mutex<Option<SweepTask>>,
}

impl CrossSessionCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        tools: Arc<ToolInvocationService>,
        error_handler: Arc<ErrorHandler>,
        collaborators: Collaborators,
        config: CoordinationConfig,
        event_bus: EventBus,
    ) -> Self {
        Self {
            registry,
            tools,
            error_handler,
            collaborators,
            config,
            state: RwLock::new(CoordinatorState::default()),
            event_bus,
            sweep: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    fn deliver_all(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.registry.deliver(notification);
        }
    }

    /// Record a failure raised by `operation` into the error history and
    /// health metrics. Execution failures are already recorded by the
    /// resilience layer.
    pub fn record_failure(&self, operation: &str, err: &CoordinationError) {
        if let CoordinationError::Execution(_) = err {
            return;
        }
        let classified = ClassifiedError::new(ErrorCategory::Validation, err.to_string(), operation, "coordinator");
        self.error_handler.record_coordination_failure(err.code(), &classified);
    }

    fn surface<T>(&self, operation: &str, result: Result<T, CoordinationError>) -> Result<T, CoordinationError> {
        if let Err(err) = &result {
            self.record_failure(operation, err);
        }
        result
    }

    // ─── Operations ─────────────────────────────────────────────────────────

    /// Start a new operation on behalf of `initiator`.
    ///
    /// `affected` defaults to every connected session. Operations whose kind
    /// needs approval and that affect anyone besides the initiator park until
    /// every other affected session approves; everything else executes before
    /// this returns.
    pub async fn initiate_operation(
        self: &Arc<Self>,
        initiator: SessionId,
        kind: OperationKind,
        affected: Option<Vec<SessionId>>,
    ) -> Result<InitiateOutcome, CoordinationError> {
        let result = self.initiate(initiator, kind, affected).await;
        self.surface("initiate_operation", result)
    }

    async fn initiate(
        self: &Arc<Self>,
        initiator: SessionId,
        kind: OperationKind,
        affected: Option<Vec<SessionId>>,
    ) -> Result<InitiateOutcome, CoordinationError> {
        if !self.registry.is_connected(initiator) {
            return Err(CoordinationError::UnknownSession(initiator));
        }
        let affected = match affected {
            Some(ids) => {
                if let Some(unknown) = ids.iter().find(|id| !self.registry.is_connected(**id)) {
                    return Err(CoordinationError::UnknownSession(*unknown));
                }
                ids
            }
            None => self.registry.session_ids(),
        };

        let mut operation = Operation::new(kind, initiator, affected)?;
        let operation_id = operation.id;
        let approvers: Vec<SessionId> = operation
            .affected_sessions
            .iter()
            .copied()
            .filter(|s| *s != initiator)
            .collect();
        let gated = operation.requires_approval && !approvers.is_empty();
        if gated && self.registry.session(initiator).is_some_and(|s| s.metadata.ephemeral) {
            return Err(CoordinationError::EphemeralInitiator(initiator));
        }

        // A held resource fails the request now, not after the approval round.
        {
            let state = self.state.read();
            for r in operation.kind.resources() {
                if let Some(conflict) = state.resources.get(&r.id).and_then(|res| res.check_available(initiator).err()) {
                    self.event_bus.publish_resource_event(ResourceEvent::LockRejected {
                        resource_id: conflict.resource.clone(),
                        requested_by: initiator,
                        held_by: conflict.holder,
                        rejected_at: Utc::now(),
                    });
                    return Err(conflict.into());
                }
            }
        }

        self.event_bus.publish_operation_event(OperationEvent::OperationInitiated {
            operation_id,
            kind: operation.operation_type(),
            initiator,
            affected_sessions: operation.affected_sessions.len(),
            requires_approval: operation.requires_approval,
            initiated_at: operation.created_at,
        });

        if !gated {
            info!(
                operation_id = %operation_id,
                kind = %operation.operation_type(),
                initiator = %initiator,
                "Operation initiated, executing immediately"
            );
            let requires_approval = operation.requires_approval;
            self.state.write().operations.insert(operation_id, operation);
            let finished = self.execute_detached(operation_id).await?;
            return Ok(InitiateOutcome {
                operation_id,
                status: finished.status,
                requires_approval,
                approval_id: None,
                approvers: Vec::new(),
                result: finished.result,
            });
        }

        let request = ApprovalRequest::new(
            operation_id,
            operation.operation_type(),
            approvers.iter().copied(),
            self.config.approval_timeout,
        );
        let approval_id = request.id;
        operation.approval_id = Some(approval_id);

        let payload = json!({
            "approvalId": approval_id,
            "operationId": operation_id,
            "kind": operation.operation_type(),
            "initiator": initiator,
            "operation": operation.kind,
            "affectedSessions": operation.affected_sessions,
            "expiresAt": request.expires_at,
        });
        let notifications: Vec<Notification> = approvers
            .iter()
            .map(|approver| Notification::new(*approver, initiator, NotificationKind::ApprovalRequired, payload.clone()))
            .collect();

        self.event_bus.publish_operation_event(OperationEvent::ApprovalRequested {
            approval_id,
            operation_id,
            approvers: approvers.clone(),
            expires_at: request.expires_at,
        });

        {
            let mut state = self.state.write();
            for r in operation.kind.resources() {
                state
                    .resources
                    .entry(r.id.clone())
                    .or_insert_with(|| SharedResource::new(r.id.clone(), r.kind, self.config.default_lock_timeout))
                    .enqueue_operation(operation_id);
            }
            state.approvals.insert(approval_id, request);
            state.operations.insert(operation_id, operation);
        }

        info!(
            operation_id = %operation_id,
            approval_id = %approval_id,
            approvers = approvers.len(),
            "Operation awaiting approval"
        );
        self.deliver_all(notifications);

        Ok(InitiateOutcome {
            operation_id,
            status: OperationStatus::Pending,
            requires_approval: true,
            approval_id: Some(approval_id),
            approvers,
            result: None,
        })
    }

    /// Record one approver's answer.
    ///
    /// A single rejection cancels the operation. The last outstanding approval
    /// executes it.
    pub async fn process_approval_response(
        self: &Arc<Self>,
        approval_id: ApprovalId,
        session_id: SessionId,
        approved: bool,
        comment: Option<String>,
    ) -> Result<ApprovalOutcome, CoordinationError> {
        let result = self.respond(approval_id, session_id, approved, comment).await;
        self.surface("process_approval_response", result)
    }

    async fn respond(
        self: &Arc<Self>,
        approval_id: ApprovalId,
        session_id: SessionId,
        approved: bool,
        comment: Option<String>,
    ) -> Result<ApprovalOutcome, CoordinationError> {
        let now = Utc::now();
        let (status, request) = {
            let mut state = self.state.write();
            let request = state
                .approvals
                .get_mut(&approval_id)
                .ok_or(CoordinationError::ApprovalNotFound(approval_id))?;
            match request.record_response(session_id, approved, comment.clone(), now) {
                Ok(status) => (status, request.clone()),
                Err(ApprovalError::Expired(at)) => {
                    let notifications = Self::finalize_expired(&mut state, approval_id, now);
                    drop(state);
                    self.deliver_all(notifications);
                    return Err(ApprovalError::Expired(at).into());
                }
                Err(e) => return Err(e.into()),
            }
        };
        let operation_id = request.operation_id;

        self.event_bus.publish_operation_event(OperationEvent::ApprovalResponded {
            approval_id,
            operation_id,
            session_id,
            approved,
            responded_at: now,
        });
        info!(
            approval_id = %approval_id,
            operation_id = %operation_id,
            session_id = %session_id,
            approved,
            status = ?status,
            "Approval response recorded"
        );

        let outcome = |operation: &Operation| ApprovalOutcome {
            approval_id,
            operation_id,
            approval_status: status,
            operation_status: operation.status,
            outstanding_approvers: request.outstanding_approvers(),
            result: operation.result.clone(),
            error: operation.error.clone(),
        };

        match status {
            ApprovalStatus::Pending | ApprovalStatus::Expired => {
                let operation = self
                    .get_operation(operation_id)
                    .ok_or(CoordinationError::OperationNotFound(operation_id))?;
                Ok(outcome(&operation))
            }
            ApprovalStatus::Rejected => {
                let (operation, notifications) = {
                    let mut state = self.state.write();
                    let operation = state
                        .operations
                        .get_mut(&operation_id)
                        .ok_or(CoordinationError::OperationNotFound(operation_id))?;
                    let reason = match &comment {
                        Some(c) => format!("rejected by {}: {}", session_id, c),
                        None => format!("rejected by {}", session_id),
                    };
                    operation.cancel(reason.clone())?;
                    let snapshot = operation.clone();
                    state.dequeue_everywhere(operation_id);

                    let payload = json!({
                        "operationId": operation_id,
                        "approvalId": approval_id,
                        "rejectedBy": session_id,
                        "comment": comment,
                    });
                    let notifications: Vec<Notification> = snapshot
                        .affected_sessions
                        .iter()
                        .map(|s| Notification::new(*s, session_id, NotificationKind::OperationRejected, payload.clone()))
                        .collect();
                    self.event_bus.publish_operation_event(OperationEvent::OperationCancelled {
                        operation_id,
                        reason,
                        cancelled_at: now,
                    });
                    (snapshot, notifications)
                };
                self.deliver_all(notifications);
                Ok(outcome(&operation))
            }
            ApprovalStatus::Approved => {
                // The responder succeeded; an execution failure lands on the operation.
                match self.execute_detached(operation_id).await {
                    Ok(_) | Err(CoordinationError::Execution(_)) => {}
                    Err(e @ CoordinationError::Locked(_)) => self.record_failure("execute_operation", &e),
                    Err(e) => return Err(e),
                }
                let operation = self
                    .get_operation(operation_id)
                    .ok_or(CoordinationError::OperationNotFound(operation_id))?;
                Ok(outcome(&operation))
            }
        }
    }

    /// Run `execute_operation` on its own task. Dropping the caller does not
    /// abort the execution.
    async fn execute_detached(self: &Arc<Self>, operation_id: OperationId) -> Result<Operation, CoordinationError> {
        let coordinator = self.clone();
        let execution = tokio::spawn(async move { coordinator.execute_operation(operation_id).await });
        match execution.await {
            Ok(result) => result,
            Err(join_err) => {
                let err = ClassifiedError::new(
                    ErrorCategory::Unknown,
                    format!("execution task failed: {}", join_err),
                    "execute_operation",
                    "coordinator",
                );
                self.error_handler.record_failure(&err);
                Err(err.into())
            }
        }
    }

    /// Lock every named resource, dispatch to the collaborator for the kind,
    /// release the locks whatever happens, then notify every affected session.
    async fn execute_operation(&self, operation_id: OperationId) -> Result<Operation, CoordinationError> {
        let (kind, initiator, affected, acquired) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let operation = state
                .operations
                .get_mut(&operation_id)
                .ok_or(CoordinationError::OperationNotFound(operation_id))?;
            operation.start()?;
            let initiator = operation.initiator;
            let resources = operation.kind.resources().to_vec();

            let conflict = resources.iter().find_map(|r| {
                state
                    .resources
                    .get(&r.id)
                    .and_then(|res| res.check_available(initiator).err())
            });

            if let Some(conflict) = conflict {
                operation.fail(conflict.to_string())?;
                let snapshot = operation.clone();
                state.dequeue_everywhere(operation_id);
                drop(guard);

                warn!(
                    operation_id = %operation_id,
                    resource_id = %conflict.resource,
                    holder = %conflict.holder,
                    "Operation failed: resource locked"
                );
                let now = Utc::now();
                self.event_bus.publish_resource_event(ResourceEvent::LockRejected {
                    resource_id: conflict.resource.clone(),
                    requested_by: initiator,
                    held_by: conflict.holder,
                    rejected_at: now,
                });
                self.event_bus.publish_operation_event(OperationEvent::OperationFailed {
                    operation_id,
                    error: conflict.to_string(),
                    failed_at: now,
                });
                self.deliver_all(Self::outcome_notifications(&snapshot));
                return Err(conflict.into());
            }

            let mut acquired = Vec::new();
            for r in &resources {
                let resource = state
                    .resources
                    .entry(r.id.clone())
                    .or_insert_with(|| SharedResource::new(r.id.clone(), r.kind, self.config.default_lock_timeout));
                resource.dequeue_operation(operation_id);
                if let Ok(LockOutcome::Acquired) =
                    resource.try_lock(initiator, AccessMode::Exclusive, self.config.default_lock_timeout)
                {
                    acquired.push(r.id.clone());
                }
            }

            let affected: Vec<SessionId> = operation.affected_sessions.iter().copied().collect();
            (operation.kind.clone(), initiator, affected, acquired)
        };

        let now = Utc::now();
        for resource_id in &acquired {
            self.event_bus.publish_resource_event(ResourceEvent::ResourceLocked {
                resource_id: resource_id.clone(),
                session_id: initiator,
                locked_at: now,
            });
        }
        self.event_bus.publish_operation_event(OperationEvent::OperationStarted {
            operation_id,
            started_at: now,
        });
        info!(
            operation_id = %operation_id,
            kind = %kind.operation_type(),
            locked_resources = acquired.len(),
            "Executing operation"
        );

        let dispatched = {
            let _release = scopeguard::guard(acquired, |acquired| {
                self.release_operation_locks(initiator, acquired);
            });
            self.dispatch(operation_id, &kind, initiator, &affected).await
        };

        let snapshot = {
            let mut state = self.state.write();
            let operation = state
                .operations
                .get_mut(&operation_id)
                .ok_or(CoordinationError::OperationNotFound(operation_id))?;
            let transition = match &dispatched {
                Ok(value) => operation.complete(value.clone()),
                Err(e) => operation.fail(e.to_string()),
            };
            if let Err(e) = transition {
                warn!(operation_id = %operation_id, error = %e, "Operation changed state while executing");
            }
            operation.clone()
        };

        let now = Utc::now();
        match &dispatched {
            Ok(_) => {
                info!(operation_id = %operation_id, "Operation completed");
                self.event_bus.publish_operation_event(OperationEvent::OperationCompleted {
                    operation_id,
                    completed_at: now,
                });
            }
            Err(e) => {
                warn!(operation_id = %operation_id, category = %e.category, "Operation failed: {}", e.message);
                self.event_bus.publish_operation_event(OperationEvent::OperationFailed {
                    operation_id,
                    error: e.to_string(),
                    failed_at: now,
                });
            }
        }
        self.deliver_all(Self::outcome_notifications(&snapshot));

        dispatched.map(|_| snapshot).map_err(CoordinationError::from)
    }

    async fn dispatch(
        &self,
        operation_id: OperationId,
        kind: &OperationKind,
        initiator: SessionId,
        affected: &[SessionId],
    ) -> Result<Value, ClassifiedError> {
        match kind {
            OperationKind::ApprovalGatedAction(action) => {
                match self.tools.invoke(initiator, &action.tool, action.arguments.clone()).await {
                    Ok(value) => Ok(value),
                    Err(ToolInvocationError::Failed(e)) => Err(e),
                    Err(ToolInvocationError::UnknownTool(name)) => {
                        let err = ClassifiedError::new(
                            ErrorCategory::Validation,
                            format!("unknown tool '{}'", name),
                            "approval_gated_action",
                            name,
                        );
                        self.error_handler.record_failure(&err);
                        Err(err)
                    }
                }
            }
            OperationKind::CoordinatedUpdate(update) => {
                self.error_handler
                    .execute("coordinated_update", UPDATE_ORCHESTRATOR, || {
                        self.collaborators.updates.apply_update(operation_id, update, affected)
                    })
                    .await
            }
            OperationKind::Generation(generation) => {
                self.error_handler
                    .execute("generation", GENERATION_SERVICE, || {
                        self.collaborators.generation.generate(operation_id, generation)
                    })
                    .await
            }
            OperationKind::Rollback(rollback) => {
                self.error_handler
                    .execute("rollback", ROLLBACK_MANAGER, || {
                        self.collaborators.rollbacks.rollback(operation_id, rollback)
                    })
                    .await
            }
        }
    }

    fn release_operation_locks(&self, holder: SessionId, acquired: Vec<ResourceId>) {
        if acquired.is_empty() {
            return;
        }
        let notifications = {
            let mut state = self.state.write();
            let mut notifications = Vec::new();
            for resource_id in acquired {
                let released = state
                    .resources
                    .get_mut(&resource_id)
                    .map(|r| r.release(holder))
                    .unwrap_or(false);
                if !released {
                    continue;
                }
                if let Some(resource) = state.resources.get(&resource_id) {
                    notifications.extend(state.release_notifications(resource, holder, "released"));
                }
                self.event_bus.publish_resource_event(ResourceEvent::ResourceReleased {
                    resource_id,
                    session_id: holder,
                    reason: "released".to_string(),
                    released_at: Utc::now(),
                });
            }
            notifications
        };
        self.deliver_all(notifications);
    }

    fn outcome_notifications(operation: &Operation) -> Vec<Notification> {
        let kind = match operation.status {
            OperationStatus::Completed => NotificationKind::OperationCompleted,
            OperationStatus::Cancelled => NotificationKind::OperationCancelled,
            _ => NotificationKind::OperationFailed,
        };
        let payload = json!({
            "operationId": operation.id,
            "kind": operation.operation_type(),
            "status": operation.status,
            "result": operation.result,
            "error": operation.error,
        });
        operation
            .affected_sessions
            .iter()
            .map(|s| Notification::new(*s, operation.initiator, kind, payload.clone()))
            .collect()
    }

    /// Expire a pending approval and cancel its operation.
    fn finalize_expired(state: &mut CoordinatorState, approval_id: ApprovalId, now: DateTime<Utc>) -> Vec<Notification> {
        let Some(request) = state.approvals.get_mut(&approval_id) else {
            return Vec::new();
        };
        request.expire();
        let operation_id = request.operation_id;

        let Some(operation) = state.operations.get_mut(&operation_id) else {
            return Vec::new();
        };
        if operation.cancel("approval expired").is_err() {
            return Vec::new();
        }
        let initiator = operation.initiator;
        let affected: Vec<SessionId> = operation.affected_sessions.iter().copied().collect();
        state.dequeue_everywhere(operation_id);

        info!(approval_id = %approval_id, operation_id = %operation_id, "Approval request expired");
        let payload = json!({
            "approvalId": approval_id,
            "operationId": operation_id,
            "expiredAt": now,
        });
        affected
            .into_iter()
            .map(|s| Notification::new(s, initiator, NotificationKind::ApprovalExpired, payload.clone()))
            .collect()
    }

    // ─── Explicit locking ───────────────────────────────────────────────────

    /// Take an explicit lock for `session_id`. Idempotent for the holder,
    /// fail-fast `locked` for everyone else.
    pub fn lock_resource(
        &self,
        session_id: SessionId,
        resource_id: ResourceId,
        kind: ResourceKind,
        mode: AccessMode,
        timeout: Option<Duration>,
    ) -> Result<(LockOutcome, SharedResource), CoordinationError> {
        let result = self.lock(session_id, resource_id, kind, mode, timeout);
        self.surface("lock_resource", result)
    }

    fn lock(
        &self,
        session_id: SessionId,
        resource_id: ResourceId,
        kind: ResourceKind,
        mode: AccessMode,
        timeout: Option<Duration>,
    ) -> Result<(LockOutcome, SharedResource), CoordinationError> {
        if !self.registry.is_connected(session_id) {
            return Err(CoordinationError::UnknownSession(session_id));
        }
        let timeout = timeout.unwrap_or(self.config.default_lock_timeout);

        let locked = {
            let mut state = self.state.write();
            let resource = state
                .resources
                .entry(resource_id.clone())
                .or_insert_with(|| SharedResource::new(resource_id.clone(), kind, timeout));
            let outcome = resource.try_lock(session_id, mode, timeout);
            let snapshot = resource.clone();
            outcome.map(|outcome| (outcome, snapshot))
        };

        let now = Utc::now();
        match locked {
            Ok((outcome, resource)) => {
                if outcome == LockOutcome::Acquired {
                    info!(resource_id = %resource_id, session_id = %session_id, "Resource locked");
                    self.event_bus.publish_resource_event(ResourceEvent::ResourceLocked {
                        resource_id,
                        session_id,
                        locked_at: now,
                    });
                }
                Ok((outcome, resource))
            }
            Err(conflict) => {
                debug!(resource_id = %resource_id, holder = %conflict.holder, "Lock request rejected");
                self.event_bus.publish_resource_event(ResourceEvent::LockRejected {
                    resource_id,
                    requested_by: session_id,
                    held_by: conflict.holder,
                    rejected_at: now,
                });
                Err(conflict.into())
            }
        }
    }

    /// Release an explicit lock. Only the holder may release.
    pub fn release_resource(&self, session_id: SessionId, resource_id: &ResourceId) -> Result<(), CoordinationError> {
        let result = self.release(session_id, resource_id);
        self.surface("release_resource", result)
    }

    fn release(&self, session_id: SessionId, resource_id: &ResourceId) -> Result<(), CoordinationError> {
        let notifications = {
            let mut state = self.state.write();
            let resource = state
                .resources
                .get_mut(resource_id)
                .ok_or_else(|| CoordinationError::ResourceNotFound(resource_id.clone()))?;
            if !resource.release(session_id) {
                return Err(CoordinationError::NotLockHolder {
                    resource: resource_id.clone(),
                    session: session_id,
                });
            }
            let resource = resource.clone();
            state.release_notifications(&resource, session_id, "released")
        };

        info!(resource_id = %resource_id, session_id = %session_id, "Resource released");
        self.event_bus.publish_resource_event(ResourceEvent::ResourceReleased {
            resource_id: resource_id.clone(),
            session_id,
            reason: "released".to_string(),
            released_at: Utc::now(),
        });
        self.deliver_all(notifications);
        Ok(())
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub fn get_operation(&self, operation_id: OperationId) -> Option<Operation> {
        self.state.read().operations.get(&operation_id).cloned()
    }

    /// Operations, oldest first. With a session, only those it initiated or is affected by.
    pub fn list_operations(&self, session_id: Option<SessionId>) -> Vec<Operation> {
        let state = self.state.read();
        let mut operations: Vec<Operation> = state
            .operations
            .values()
            .filter(|op| match session_id {
                Some(s) => op.initiator == s || op.affected_sessions.contains(&s),
                None => true,
            })
            .cloned()
            .collect();
        operations.sort_by_key(|op| op.created_at);
        operations
    }

    pub fn get_approval(&self, approval_id: ApprovalId) -> Option<ApprovalRequest> {
        self.state.read().approvals.get(&approval_id).cloned()
    }

    /// Pending approval requests still waiting on `session_id`.
    pub fn pending_approvals_for(&self, session_id: SessionId) -> Vec<ApprovalRequest> {
        self.state
            .read()
            .approvals
            .values()
            .filter(|a| {
                a.status == ApprovalStatus::Pending
                    && a.required_approvers.contains(&session_id)
                    && !a.has_responded(session_id)
            })
            .cloned()
            .collect()
    }

    pub fn resource_status(&self, resource_id: &ResourceId) -> Option<SharedResource> {
        self.state.read().resources.get(resource_id).cloned()
    }

    pub fn resources(&self) -> Vec<SharedResource> {
        self.state.read().resources.values().cloned().collect()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = self.state.read();
        let mut operations = OperationCounts::default();
        for op in state.operations.values() {
            match op.status {
                OperationStatus::Pending => operations.pending += 1,
                OperationStatus::InProgress => operations.in_progress += 1,
                OperationStatus::Completed => operations.completed += 1,
                OperationStatus::Failed => operations.failed += 1,
                OperationStatus::Cancelled => operations.cancelled += 1,
            }
        }
        CoordinatorStats {
            operations,
            pending_approvals: state
                .approvals
                .values()
                .filter(|a| a.status == ApprovalStatus::Pending)
                .count(),
            tracked_resources: state.resources.len(),
            locked_resources: state.resources.values().filter(|r| r.is_locked()).count(),
        }
    }

    // ─── Sweep ──────────────────────────────────────────────────────────────

    /// One pass of housekeeping: expire overdue approvals, purge finished
    /// operations past retention, release locks past their timeout.
    pub fn sweep_once(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();
        let mut released = Vec::new();

        let notifications = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let mut notifications = Vec::new();

            let overdue: Vec<ApprovalId> = state
                .approvals
                .values()
                .filter(|a| a.status == ApprovalStatus::Pending && a.is_expired(now))
                .map(|a| a.id)
                .collect();
            for approval_id in overdue {
                if let Some(request) = state.approvals.get(&approval_id) {
                    self.event_bus.publish_operation_event(OperationEvent::ApprovalExpired {
                        approval_id,
                        operation_id: request.operation_id,
                        expired_at: now,
                    });
                }
                notifications.extend(Self::finalize_expired(state, approval_id, now));
                report.expired_approvals += 1;
            }

            let retention = self.config.operation_retention;
            let stale: Vec<(OperationId, Option<ApprovalId>)> = state
                .operations
                .values()
                .filter(|op| op.is_expired_for_retention(now, retention))
                .map(|op| (op.id, op.approval_id))
                .collect();
            for (operation_id, approval_id) in stale {
                state.operations.remove(&operation_id);
                if let Some(approval_id) = approval_id {
                    state.approvals.remove(&approval_id);
                }
                state.dequeue_everywhere(operation_id);
                report.purged_operations += 1;
            }

            let expired_locks: Vec<ResourceId> = state
                .resources
                .values()
                .filter(|r| r.is_lock_expired(now))
                .map(|r| r.id.clone())
                .collect();
            for resource_id in expired_locks {
                let Some(resource) = state.resources.get_mut(&resource_id) else {
                    continue;
                };
                let Some(holder) = resource.locked_by else {
                    continue;
                };
                resource.force_release();
                let resource = resource.clone();
                notifications.extend(state.release_notifications(&resource, holder, "lock_expired"));
                released.push((resource_id, holder));
                report.released_locks += 1;
            }

            state
                .resources
                .retain(|_, r| r.is_locked() || !r.pending_operations.is_empty());

            notifications
        };

        for (resource_id, holder) in released {
            warn!(resource_id = %resource_id, holder = %holder, "Lock timed out, released by sweep");
            self.event_bus.publish_resource_event(ResourceEvent::ResourceReleased {
                resource_id,
                session_id: holder,
                reason: "lock_expired".to_string(),
                released_at: now,
            });
        }
        self.deliver_all(notifications);

        if report.is_empty() {
            debug!("Coordination sweep found nothing to do");
        } else {
            info!(
                expired_approvals = report.expired_approvals,
                purged_operations = report.purged_operations,
                released_locks = report.released_locks,
                "Coordination sweep completed"
            );
        }
        report
    }

    /// Spawn the periodic sweep. A second call while running is a no-op.
    pub fn start_sweep(self: &Arc<Self>) {
        let mut sweep = self.sweep.lock();
        if sweep.is_some() {
            return;
        }
        let sweeper = Arc::new(CoordinationSweeper::new(Arc::downgrade(self), self.config.sweep_interval));
        let token = sweeper.shutdown_token();
        let handle = sweeper.start();
        *sweep = Some(SweepTask { token, handle });
    }

    /// Cancel the sweep task and wait for it to finish.
    pub async fn stop_sweep(&self) {
        let task = self.sweep.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!("Coordination sweep task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweep.lock().is_some()
    }
}

#[async_trait]
impl SessionLifecycleListener for CrossSessionCoordinator {
    /// Cancel the session's pending operations and release its locks.
    ///
    /// Approval requests merely waiting on the departed session are left to
    /// expire.
    async fn on_session_closed(&self, session_id: SessionId) {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        let mut released = Vec::new();

        let notifications = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let mut notifications = Vec::new();

            let pending: Vec<OperationId> = state
                .operations
                .values()
                .filter(|op| op.initiator == session_id && op.status == OperationStatus::Pending)
                .map(|op| op.id)
                .collect();
            for operation_id in pending {
                let Some(operation) = state.operations.get_mut(&operation_id) else {
                    continue;
                };
                if operation.cancel("initiator disconnected").is_err() {
                    continue;
                }
                if let Some(approval_id) = operation.approval_id {
                    state.approvals.remove(&approval_id);
                }
                let payload = json!({
                    "operationId": operation_id,
                    "reason": "initiator disconnected",
                });
                notifications.extend(
                    operation
                        .affected_sessions
                        .iter()
                        .filter(|s| **s != session_id)
                        .map(|s| Notification::new(*s, session_id, NotificationKind::OperationCancelled, payload.clone())),
                );
                state.dequeue_everywhere(operation_id);
                cancelled.push(operation_id);
            }

            let held: Vec<ResourceId> = state
                .resources
                .values()
                .filter(|r| r.locked_by == Some(session_id))
                .map(|r| r.id.clone())
                .collect();
            for resource_id in held {
                if let Some(resource) = state.resources.get_mut(&resource_id) {
                    resource.force_release();
                    let resource = resource.clone();
                    notifications.extend(state.release_notifications(&resource, session_id, "disconnect"));
                    released.push(resource_id);
                }
            }

            notifications
        };

        for operation_id in &cancelled {
            self.event_bus.publish_operation_event(OperationEvent::OperationCancelled {
                operation_id: *operation_id,
                reason: "initiator disconnected".to_string(),
                cancelled_at: now,
            });
        }
        for resource_id in &released {
            self.event_bus.publish_resource_event(ResourceEvent::ResourceReleased {
                resource_id: resource_id.clone(),
                session_id,
                reason: "disconnect".to_string(),
                released_at: now,
            });
        }
        if !cancelled.is_empty() || !released.is_empty() {
            info!(
                session_id = %session_id,
                cancelled_operations = cancelled.len(),
                released_resources = released.len(),
                "Cleaned up after disconnected session"
            );
        }
        self.deliver_all(notifications);
    }
}
