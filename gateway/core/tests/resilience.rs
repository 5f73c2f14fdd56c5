// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use mcp_gateway_core::application::Gateway;
use mcp_gateway_core::domain::failure::{CircuitState, ErrorCategory};
use mcp_gateway_core::domain::gateway_config::{ResilienceConfig, ToolConfig};
use mcp_gateway_core::domain::protocol::{methods, JsonRpcRequest};
use mcp_gateway_core::domain::session::ClientMetadata;
use mcp_gateway_core::infrastructure::ErrorHandler;

fn breaker_config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.cool_down = Duration::from_secs(30);
    config
}

async fn fail_unavailable(handler: &ErrorHandler) {
    let result: Result<(), _> = handler
        .execute("deploy", "orchestrator", || async {
            Err(anyhow::anyhow!("HTTP 503 Service Unavailable"))
        })
        .await;
    assert_eq!(result.unwrap_err().category, ErrorCategory::DependencyUnavailable);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_probes_and_closes() {
    let handler = ErrorHandler::new(&breaker_config());

    fail_unavailable(&handler).await;
    assert_eq!(handler.breaker("orchestrator").state(), CircuitState::Closed);
    fail_unavailable(&handler).await;
    assert_eq!(handler.breaker("orchestrator").state(), CircuitState::Open);

    let invoked = AtomicU32::new(0);
    let rejected: Result<(), _> = handler
        .execute("deploy", "orchestrator", || {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
    assert!(rejected.is_err());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_secs(31)).await;

    let probed: Result<&str, _> = handler
        .execute("deploy", "orchestrator", || {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok("deployed") }
        })
        .await;
    assert_eq!(probed.unwrap(), "deployed");
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(handler.breaker("orchestrator").state(), CircuitState::Closed);

    let snapshot = handler
        .breaker_snapshots()
        .into_iter()
        .find(|s| s.dependency == "orchestrator")
        .unwrap();
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(snapshot.rejected_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_breaker() {
    let handler = ErrorHandler::new(&breaker_config());
    fail_unavailable(&handler).await;
    fail_unavailable(&handler).await;

    tokio::time::advance(Duration::from_secs(31)).await;
    fail_unavailable(&handler).await;

    assert_eq!(handler.breaker("orchestrator").state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_breakers_are_isolated_per_dependency() {
    let handler = ErrorHandler::new(&breaker_config());
    fail_unavailable(&handler).await;
    fail_unavailable(&handler).await;

    let other: Result<u32, _> = handler.execute("status", "git", || async { Ok(7) }).await;
    assert_eq!(other.unwrap(), 7);
    assert_eq!(handler.breaker("git").state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_failure_surfaces_primary_error() {
    let handler = ErrorHandler::new(&breaker_config());

    let result: Result<String, _> = handler
        .execute_with_fallback(
            "render",
            "generator",
            || async { Err(anyhow::anyhow!("request timed out")) },
            |original| async move {
                assert_eq!(original.category, ErrorCategory::Timeout);
                Err(anyhow::anyhow!("cache miss"))
            },
        )
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.category, ErrorCategory::Timeout);
    assert_eq!(err.attempts, 3);
    assert_eq!(handler.health_metrics().fallback_invocations, 1);
}

#[tokio::test]
async fn test_unavailable_downstream_tool_trips_breaker() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/tools/git")
        .with_status(503)
        .with_body("maintenance window")
        .expect(2)
        .create_async()
        .await;

    let mut config = common::config();
    config.spec.resilience.circuit_breaker.failure_threshold = 2;
    config.spec.tools.push(ToolConfig {
        name: "git_status".to_string(),
        description: "Working tree status".to_string(),
        input_schema: json!({"type": "object"}),
        endpoint: format!("{}/tools/git", server.url()),
        dependency: Some("git".to_string()),
    });
    let gateway = Arc::new(Gateway::builder(config).build().unwrap());
    let session = gateway.registry().connect(ClientMetadata::new("ide", None));

    let mut categories = Vec::new();
    for id in 0..3 {
        let response = gateway
            .registry()
            .dispatch(
                session,
                JsonRpcRequest::new(id, methods::TOOLS_CALL, Some(json!({"name": "git_status"}))),
            )
            .await
            .unwrap()
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        categories.push(result["structuredContent"]["category"].clone());
    }

    assert!(categories.iter().all(|c| c == &json!("dependency_unavailable")));
    assert_eq!(gateway.error_handler().breaker("git").state(), CircuitState::Open);
    mock.assert_async().await;
}
