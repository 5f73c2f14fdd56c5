// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end coordination scenarios driven through the public API.

mod common;

use serde_json::{json, Value};

use common::ScriptedCollaborator;
use mcp_gateway_core::application::coordinator::CoordinationError;
use mcp_gateway_core::domain::approval::ApprovalStatus;
use mcp_gateway_core::domain::failure::ErrorCategory;
use mcp_gateway_core::domain::notification::{Notification, NotificationKind};
use mcp_gateway_core::domain::operation::{CoordinatedUpdate, Generation, OperationKind, OperationStatus};
use mcp_gateway_core::domain::protocol::{methods, JsonRpcRequest};
use mcp_gateway_core::domain::resource::{AccessMode, ResourceId, ResourceKind, ResourceRef};
use mcp_gateway_core::domain::session::{ClientMetadata, SessionId};
use mcp_gateway_core::application::Gateway;

fn update(resource: &str) -> OperationKind {
    OperationKind::CoordinatedUpdate(CoordinatedUpdate {
        target: "platform-api".to_string(),
        version: "2.4.0".to_string(),
        resources: vec![ResourceRef::new(resource, ResourceKind::Environment)],
        parameters: Value::Null,
    })
}

fn generation(resource: &str) -> OperationKind {
    OperationKind::Generation(Generation {
        target: "ci".to_string(),
        template: "pipeline".to_string(),
        parameters: json!({}),
        resources: vec![ResourceRef::new(resource, ResourceKind::Pipeline)],
    })
}

fn connect(gateway: &Gateway, name: &str) -> SessionId {
    gateway.registry().connect(ClientMetadata::new(name, None))
}

fn kinds(notifications: &[Notification]) -> Vec<NotificationKind> {
    notifications.iter().map(|n| n.kind).collect()
}

/// Call a tool over JSON-RPC exactly as a client would and return `structuredContent`.
async fn call_tool(gateway: &Gateway, session: SessionId, name: &str, arguments: Value) -> Value {
    let response = gateway
        .registry()
        .dispatch(
            session,
            JsonRpcRequest::new(1, methods::TOOLS_CALL, Some(json!({"name": name, "arguments": arguments}))),
        )
        .await
        .unwrap()
        .unwrap();
    response.result.unwrap()["structuredContent"].clone()
}

#[tokio::test]
async fn test_update_executes_once_every_affected_session_approves() {
    let collaborator = ScriptedCollaborator::succeeding();
    let gateway = common::gateway(&collaborator);
    let a = connect(&gateway, "a");
    let b = connect(&gateway, "b");
    let c = connect(&gateway, "c");

    let initiated = call_tool(
        &gateway,
        a,
        "coordination_initiate_operation",
        json!({
            "kind": "coordinated_update",
            "payload": {"target": "platform-api", "version": "2.4.0"},
            "affected_sessions": [a, b, c],
        }),
    )
    .await;
    assert_eq!(initiated["status"], json!("pending"));
    let approval_id = initiated["approvalId"].clone();

    for approver in [b, c] {
        let pending = gateway.registry().drain_notifications(approver).unwrap();
        assert_eq!(kinds(&pending), vec![NotificationKind::ApprovalRequired]);
        assert!(gateway.registry().acknowledge(approver, pending[0].id).unwrap());
    }

    let first = call_tool(
        &gateway,
        b,
        "coordination_respond_to_approval",
        json!({"approval_id": approval_id, "approved": true}),
    )
    .await;
    assert_eq!(first["approvalStatus"], json!("pending"));
    assert_eq!(collaborator.calls(), 0);

    let last = call_tool(
        &gateway,
        c,
        "coordination_respond_to_approval",
        json!({"approval_id": approval_id, "approved": true}),
    )
    .await;
    assert_eq!(last["approvalStatus"], json!("approved"));
    assert_eq!(last["operationStatus"], json!("completed"));
    assert_eq!(last["result"]["version"], json!("2.4.0"));
    assert_eq!(collaborator.calls(), 1);

    for session in [a, b, c] {
        let received = gateway.registry().drain_notifications(session).unwrap();
        assert!(
            kinds(&received).contains(&NotificationKind::OperationCompleted),
            "session {session} missed the completion"
        );
    }
}

#[tokio::test]
async fn test_single_rejection_cancels_and_carries_comment() {
    let collaborator = ScriptedCollaborator::succeeding();
    let gateway = common::gateway(&collaborator);
    let coordinator = gateway.coordinator();
    let a = connect(&gateway, "a");
    let b = connect(&gateway, "b");
    let c = connect(&gateway, "c");

    let initiated = coordinator.initiate_operation(a, update("env:prod"), None).await.unwrap();
    let approval_id = initiated.approval_id.unwrap();

    coordinator
        .process_approval_response(approval_id, b, true, None)
        .await
        .unwrap();
    let outcome = coordinator
        .process_approval_response(approval_id, c, false, Some("freeze until Monday".to_string()))
        .await
        .unwrap();

    assert_eq!(outcome.approval_status, ApprovalStatus::Rejected);
    assert_eq!(outcome.operation_status, OperationStatus::Cancelled);
    assert_eq!(
        coordinator.get_operation(initiated.operation_id).unwrap().status,
        OperationStatus::Cancelled
    );
    assert_eq!(collaborator.calls(), 0);

    for session in [a, b] {
        let rejection = gateway
            .registry()
            .drain_notifications(session)
            .unwrap()
            .into_iter()
            .find(|n| n.kind == NotificationKind::OperationRejected)
            .expect("rejection notification");
        assert_eq!(rejection.payload["comment"], json!("freeze until Monday"));
        assert_eq!(rejection.payload["rejectedBy"], json!(c));
    }

    // the request is final: late answers are refused
    assert!(matches!(
        coordinator.process_approval_response(approval_id, b, true, None).await,
        Err(CoordinationError::Approval(_))
    ));
}

#[tokio::test]
async fn test_locked_resource_fails_fast_until_holder_disconnects() {
    let collaborator = ScriptedCollaborator::succeeding();
    let gateway = common::gateway(&collaborator);
    let coordinator = gateway.coordinator();
    let x = connect(&gateway, "x");
    let y = connect(&gateway, "y");
    let resource = ResourceId::new("pipeline:release");

    coordinator
        .lock_resource(x, resource.clone(), ResourceKind::Pipeline, AccessMode::Exclusive, None)
        .unwrap();

    let err = coordinator
        .initiate_operation(y, generation("pipeline:release"), Some(vec![y]))
        .await
        .unwrap_err();
    assert!(matches!(&err, CoordinationError::Locked(conflict) if conflict.holder == x));
    assert_eq!(err.code(), "locked");
    assert_eq!(collaborator.calls(), 0);

    let health = gateway.error_handler().health_metrics();
    assert_eq!(health.coordination_failures.get("locked"), Some(&1));
    let recorded = gateway.error_handler().error_history(1);
    assert_eq!(recorded[0].operation, "initiate_operation");
    assert!(recorded[0].message.starts_with("locked"));

    assert!(gateway.registry().unregister(x).await);
    assert!(coordinator.resource_status(&resource).unwrap().locked_by.is_none());

    let retried = coordinator
        .initiate_operation(y, generation("pipeline:release"), Some(vec![y]))
        .await
        .unwrap();
    assert_eq!(retried.status, OperationStatus::Completed);
    // execution locks are released again afterwards
    assert!(coordinator.resource_status(&resource).unwrap().locked_by.is_none());
}

#[tokio::test]
async fn test_disconnect_leaves_no_pending_operations_or_locks() {
    let collaborator = ScriptedCollaborator::succeeding();
    let gateway = common::gateway(&collaborator);
    let coordinator = gateway.coordinator();
    let a = connect(&gateway, "a");
    let b = connect(&gateway, "b");

    let first = coordinator.initiate_operation(a, update("env:staging"), None).await.unwrap();
    let second = coordinator.initiate_operation(a, update("env:qa"), None).await.unwrap();
    coordinator
        .lock_resource(a, ResourceId::new("repo:platform-api"), ResourceKind::Repository, AccessMode::Write, None)
        .unwrap();

    gateway.registry().unregister(a).await;

    for id in [first.operation_id, second.operation_id] {
        assert_eq!(coordinator.get_operation(id).unwrap().status, OperationStatus::Cancelled);
    }
    assert!(coordinator.resources().iter().all(|r| r.locked_by.is_none()));
    assert!(coordinator.pending_approvals_for(b).is_empty());

    let notices = gateway.registry().drain_notifications(b).unwrap();
    assert_eq!(
        notices
            .iter()
            .filter(|n| n.kind == NotificationKind::OperationCancelled)
            .count(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_are_retried_then_surface_as_timeout() {
    let collaborator = ScriptedCollaborator::failing(u32::MAX, "upstream request timed out");
    let gateway = common::gateway(&collaborator);
    let a = connect(&gateway, "a");

    let err = gateway
        .coordinator()
        .initiate_operation(a, generation("pipeline:nightly"), None)
        .await
        .unwrap_err();

    match err {
        CoordinationError::Execution(failure) => {
            assert_eq!(failure.category, ErrorCategory::Timeout);
            assert_eq!(failure.attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(collaborator.calls(), 3);

    let operations = gateway.coordinator().list_operations(Some(a));
    assert_eq!(operations[0].status, OperationStatus::Failed);
    assert_eq!(gateway.error_handler().health_metrics().total_failures, 3);
}

#[tokio::test]
async fn test_validation_failures_are_not_retried() {
    let collaborator = ScriptedCollaborator::failing(u32::MAX, "HTTP 422 Unprocessable Entity: bad template");
    let gateway = common::gateway(&collaborator);
    let a = connect(&gateway, "a");

    let result = call_tool(
        &gateway,
        a,
        "coordination_initiate_operation",
        json!({
            "kind": "generation",
            "payload": {"target": "ci", "template": "pipeline"},
        }),
    )
    .await;

    assert_eq!(result["category"], json!("validation"));
    assert_eq!(result["attempts"], json!(1));
    assert_eq!(collaborator.calls(), 1);
}
