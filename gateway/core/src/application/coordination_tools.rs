// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Coordination tools.
//!
//! The `coordination_*` tools are answered by the [`CrossSessionCoordinator`]
//! and the session registry directly; they never go through downstream
//! dispatch.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::application::coordinator::{CoordinationError, CrossSessionCoordinator};
use crate::domain::approval::ApprovalId;
use crate::domain::notification::NotificationId;
use crate::domain::operation::{OperationId, OperationKind};
use crate::domain::resource::{AccessMode, LockOutcome, ResourceId, ResourceKind};
use crate::domain::session::SessionId;
use crate::domain::tool::ToolDescriptor;

pub const PREFIX: &str = "coordination_";

pub const INITIATE_OPERATION: &str = "coordination_initiate_operation";
pub const RESPOND_TO_APPROVAL: &str = "coordination_respond_to_approval";
pub const GET_OPERATION: &str = "coordination_get_operation";
pub const LIST_OPERATIONS: &str = "coordination_list_operations";
pub const LOCK_RESOURCE: &str = "coordination_lock_resource";
pub const RELEASE_RESOURCE: &str = "coordination_release_resource";
pub const LIST_SESSIONS: &str = "coordination_list_sessions";
pub const POLL_NOTIFICATIONS: &str = "coordination_poll_notifications";
pub const ACKNOWLEDGE_NOTIFICATION: &str = "coordination_acknowledge_notification";

pub fn is_coordination_tool(name: &str) -> bool {
    name.starts_with(PREFIX)
}

fn resource_kinds() -> Value {
    json!(["repository", "pipeline", "environment", "container", "virtual_machine", "infrastructure", "other"])
}

pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new(
            INITIATE_OPERATION,
            "Start an operation that may affect other sessions. Coordinated updates, \
             approval-gated actions and rollbacks wait for every other affected session to approve; \
             they need a session that outlives the request (SSE, or an initialized Mcp-Session-Id).",
            json!({
                "type": "object",
                "properties": {
                    "kind": {
                        "type": "string",
                        "enum": ["coordinated_update", "approval_gated_action", "generation", "rollback"]
                    },
                    "payload": { "type": "object" },
                    "affected_sessions": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Defaults to every connected session"
                    }
                },
                "required": ["kind", "payload"]
            }),
        ),
        ToolDescriptor::new(
            RESPOND_TO_APPROVAL,
            "Approve or reject a pending operation. One rejection cancels it.",
            json!({
                "type": "object",
                "properties": {
                    "approval_id": { "type": "string" },
                    "approved": { "type": "boolean" },
                    "comment": { "type": "string" }
                },
                "required": ["approval_id", "approved"]
            }),
        ),
        ToolDescriptor::new(
            GET_OPERATION,
            "Current state of an operation.",
            json!({
                "type": "object",
                "properties": { "operation_id": { "type": "string" } },
                "required": ["operation_id"]
            }),
        ),
        ToolDescriptor::new(
            LIST_OPERATIONS,
            "List operations and the approvals waiting on the caller.",
            json!({
                "type": "object",
                "properties": {
                    "mine_only": {
                        "type": "boolean",
                        "description": "Only operations the caller initiated or is affected by"
                    }
                }
            }),
        ),
        ToolDescriptor::new(
            LOCK_RESOURCE,
            "Take an exclusive lock on a shared resource. Fails immediately if another session holds it.",
            json!({
                "type": "object",
                "properties": {
                    "resource_id": { "type": "string" },
                    "kind": { "type": "string", "enum": resource_kinds() },
                    "mode": { "type": "string", "enum": ["read", "write", "exclusive"] },
                    "timeout_seconds": { "type": "integer", "minimum": 1 }
                },
                "required": ["resource_id"]
            }),
        ),
        ToolDescriptor::new(
            RELEASE_RESOURCE,
            "Release a lock held by the caller.",
            json!({
                "type": "object",
                "properties": { "resource_id": { "type": "string" } },
                "required": ["resource_id"]
            }),
        ),
        ToolDescriptor::new(
            LIST_SESSIONS,
            "List connected sessions.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolDescriptor::new(
            POLL_NOTIFICATIONS,
            "Fetch queued notifications for the caller. Approval requests stay queued until acknowledged.",
            json!({ "type": "object", "properties": {} }),
        ),
        ToolDescriptor::new(
            ACKNOWLEDGE_NOTIFICATION,
            "Acknowledge a notification so it is no longer redelivered.",
            json!({
                "type": "object",
                "properties": { "notification_id": { "type": "string" } },
                "required": ["notification_id"]
            }),
        ),
    ]
}

#[derive(Debug, Deserialize)]
struct InitiateArgs {
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    affected_sessions: Option<Vec<SessionId>>,
}

#[derive(Debug, Deserialize)]
struct RespondArgs {
    approval_id: ApprovalId,
    approved: bool,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationArgs {
    operation_id: OperationId,
}

#[derive(Debug, Deserialize, Default)]
struct ListOperationsArgs {
    #[serde(default)]
    mine_only: bool,
}

#[derive(Debug, Deserialize)]
struct LockArgs {
    resource_id: ResourceId,
    #[serde(default)]
    kind: ResourceKind,
    #[serde(default)]
    mode: AccessMode,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReleaseArgs {
    resource_id: ResourceId,
}

#[derive(Debug, Deserialize)]
struct AcknowledgeArgs {
    notification_id: NotificationId,
}

fn parse<T: DeserializeOwned>(arguments: Value) -> Result<T, CoordinationError> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| CoordinationError::InvalidArguments(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Run coordination tool `name` for `session_id`.
pub async fn dispatch(
    coordinator: &Arc<CrossSessionCoordinator>,
    session_id: SessionId,
    name: &str,
    arguments: Value,
) -> Result<Value, CoordinationError> {
    // Failures raised here rather than inside the coordinator.
    let local = |e: CoordinationError| {
        coordinator.record_failure(name, &e);
        e
    };

    match name {
        INITIATE_OPERATION => {
            let args: InitiateArgs = parse(arguments).map_err(local)?;
            let kind = OperationKind::from_parts(&args.kind, args.payload)
                .map_err(|e| local(e.into()))?;
            let outcome = coordinator
                .initiate_operation(session_id, kind, args.affected_sessions)
                .await?;
            Ok(to_value(&outcome))
        }
        RESPOND_TO_APPROVAL => {
            let args: RespondArgs = parse(arguments).map_err(local)?;
            let outcome = coordinator
                .process_approval_response(args.approval_id, session_id, args.approved, args.comment)
                .await?;
            Ok(to_value(&outcome))
        }
        GET_OPERATION => {
            let args: OperationArgs = parse(arguments).map_err(local)?;
            let operation = coordinator
                .get_operation(args.operation_id)
                .ok_or(CoordinationError::OperationNotFound(args.operation_id))
                .map_err(local)?;
            let approval = operation.approval_id.and_then(|id| coordinator.get_approval(id));
            Ok(json!({ "operation": operation, "approval": approval }))
        }
        LIST_OPERATIONS => {
            let args: ListOperationsArgs = parse(arguments).map_err(local)?;
            let filter = args.mine_only.then_some(session_id);
            Ok(json!({
                "operations": coordinator.list_operations(filter),
                "pendingApprovals": coordinator.pending_approvals_for(session_id),
            }))
        }
        LOCK_RESOURCE => {
            let args: LockArgs = parse(arguments).map_err(local)?;
            let (outcome, resource) = coordinator.lock_resource(
                session_id,
                args.resource_id,
                args.kind,
                args.mode,
                args.timeout_seconds.map(Duration::from_secs),
            )?;
            Ok(json!({
                "resource": resource,
                "alreadyHeld": outcome == LockOutcome::AlreadyHeld,
            }))
        }
        RELEASE_RESOURCE => {
            let args: ReleaseArgs = parse(arguments).map_err(local)?;
            coordinator.release_resource(session_id, &args.resource_id)?;
            Ok(json!({ "released": args.resource_id }))
        }
        LIST_SESSIONS => {
            let sessions: Vec<Value> = coordinator
                .registry()
                .sessions()
                .into_iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "clientId": s.metadata.client_id,
                        "state": s.state,
                        "createdAt": s.created_at,
                        "self": s.id == session_id,
                    })
                })
                .collect();
            Ok(json!({ "sessions": sessions }))
        }
        POLL_NOTIFICATIONS => {
            let notifications = coordinator
                .registry()
                .drain_notifications(session_id)
                .map_err(|e| local(e.into()))?;
            Ok(json!({ "notifications": notifications }))
        }
        ACKNOWLEDGE_NOTIFICATION => {
            let args: AcknowledgeArgs = parse(arguments).map_err(local)?;
            let acknowledged = coordinator
                .registry()
                .acknowledge(session_id, args.notification_id)
                .map_err(|e| local(e.into()))?;
            Ok(json!({ "acknowledged": acknowledged }))
        }
        other => Err(local(CoordinationError::InvalidArguments(format!(
            "unknown coordination tool '{}'",
            other
        )))),
    }
}
