// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::ScriptedCollaborator;
use mcp_gateway_core::application::Gateway;
use mcp_gateway_core::domain::resource::{AccessMode, ResourceId, ResourceKind};
use mcp_gateway_core::domain::session::ClientMetadata;
use mcp_gateway_core::presentation::{app, SESSION_HEADER};

fn setup() -> (Arc<Gateway>, Router) {
    let gateway = common::gateway(&ScriptedCollaborator::succeeding());
    let router = app(gateway.clone(), None);
    (gateway, router)
}

fn rpc(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

fn post(uri: &str, body: &Value, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::USER_AGENT, "integration-test");
    if let Some(session) = session {
        builder = builder.header(SESSION_HEADER, session);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_reports_healthy() {
    let (_, router) = setup();
    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], json!("healthy"));
}

#[tokio::test]
async fn test_initialize_issues_session_header_for_follow_ups() {
    let (gateway, router) = setup();

    let response = router
        .clone()
        .oneshot(post("/mcp", &rpc(1, "initialize", json!({"clientInfo": {"name": "ide"}})), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = response
        .headers()
        .get(SESSION_HEADER)
        .expect("session header")
        .to_str()
        .unwrap()
        .to_string();
    let body = json_body(response).await;
    assert_eq!(body["result"]["serverInfo"]["name"], json!("mcp-gateway"));
    assert_eq!(gateway.registry().len(), 1);

    let listed = router
        .clone()
        .oneshot(post("/mcp", &rpc(2, "tools/list", json!({})), Some(&session)))
        .await
        .unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    let tools = json_body(listed).await["result"]["tools"].as_array().unwrap().len();
    assert_eq!(tools, 9);

    let deleted = router
        .clone()
        .oneshot(
            Request::delete("/mcp")
                .header(SESSION_HEADER, &session)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    assert!(gateway.registry().is_empty());

    let gone = router
        .oneshot(post("/mcp", &rpc(3, "ping", json!({})), Some(&session)))
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sessionless_request_uses_ephemeral_session() {
    let (gateway, router) = setup();
    let response = router.oneshot(post("/mcp", &rpc(1, "ping", json!({})), None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(SESSION_HEADER).is_none());
    assert_eq!(json_body(response).await["result"], json!({}));
    assert!(gateway.registry().is_empty());
}

#[tokio::test]
async fn test_malformed_payload_is_a_parse_error() {
    let (_, router) = setup();
    let response = router
        .oneshot(
            Request::post("/mcp")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], json!(-32700));
}

#[tokio::test]
async fn test_messages_require_a_known_session() {
    let (_, router) = setup();

    let unknown = router
        .clone()
        .oneshot(post(
            "/messages?sessionId=7f1c3a52-0c43-4a61-9d0e-3f1e4b1b2c3d",
            &rpc(1, "ping", json!({})),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let invalid = router
        .oneshot(post("/messages?sessionId=nope", &rpc(1, "ping", json!({})), None))
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sse_channel_carries_correlated_responses() {
    let (gateway, router) = setup();

    let response = router
        .clone()
        .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut stream = response.into_body().into_data_stream();

    let first = String::from_utf8(stream.next().await.unwrap().unwrap().to_vec()).unwrap();
    assert!(first.contains("event: endpoint"), "{first}");
    let endpoint = first
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .unwrap()
        .trim()
        .to_string();
    assert!(endpoint.starts_with("/messages?sessionId="));
    assert_eq!(gateway.registry().len(), 1);

    let accepted = router
        .oneshot(post(&endpoint, &rpc(7, "ping", json!({})), None))
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);

    let next = String::from_utf8(stream.next().await.unwrap().unwrap().to_vec()).unwrap();
    assert!(next.contains("event: message"), "{next}");
    assert!(next.contains("\"id\":7"), "{next}");
}

#[tokio::test]
async fn test_status_and_disabled_prometheus() {
    let (_, router) = setup();

    let status = router
        .clone()
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::OK);
    let body = json_body(status).await;
    assert_eq!(body["tools"], json!(0));
    assert_eq!(body["sessions"]["total_sessions"], json!(0));
    assert!(body["coordination"].is_object());

    let metrics = router
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    assert!(json_body(metrics).await["circuitBreakers"].is_array());

    let prometheus = router
        .oneshot(Request::get("/metrics/prometheus").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(prometheus.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_report_lock_conflicts() {
    let (gateway, router) = setup();
    let holder = gateway.registry().connect(ClientMetadata::new("holder", None));
    let contender = gateway.registry().connect(ClientMetadata::new("contender", None));
    let resource = ResourceId::new("env:staging");

    gateway
        .coordinator()
        .lock_resource(holder, resource.clone(), ResourceKind::Environment, AccessMode::Exclusive, None)
        .unwrap();
    let conflict = gateway
        .coordinator()
        .lock_resource(contender, resource, ResourceKind::Environment, AccessMode::Exclusive, None)
        .unwrap_err();
    assert_eq!(conflict.code(), "locked");

    let response = router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["health"]["coordination_failures"]["locked"], json!(1));
    assert_eq!(body["health"]["total_failures"], json!(1));
    let recent = body["recentErrors"].as_array().unwrap();
    assert_eq!(recent.last().unwrap()["operation"], json!("lock_resource"));
}

#[tokio::test]
async fn test_single_shot_request_cannot_park_an_approval() {
    let (gateway, router) = setup();
    let approver = gateway.registry().connect(ClientMetadata::new("approver", None));

    let call = rpc(
        3,
        "tools/call",
        json!({
            "name": "coordination_initiate_operation",
            "arguments": {
                "kind": "coordinated_update",
                "payload": {"target": "platform-api", "version": "2.4.0"},
                "affected_sessions": [approver],
            },
        }),
    );
    let response = router.oneshot(post("/mcp", &call, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let result = json_body(response).await["result"].clone();

    assert_eq!(result["isError"], json!(true));
    assert_eq!(result["structuredContent"]["error"], json!("ephemeral_session"));
    assert!(gateway.coordinator().list_operations(None).is_empty());
    assert!(gateway.registry().drain_notifications(approver).unwrap().is_empty());
    assert_eq!(gateway.registry().len(), 1);
}
