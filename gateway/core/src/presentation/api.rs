// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP surface
//!
//! Two MCP transports over the same session registry plus operational
//! endpoints:
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /sse` | persistent channel; first event `endpoint` names the message URL |
//! | `POST /messages?sessionId=` | correlated client message, answered on the stream |
//! | `POST /mcp` | single-shot request/response |
//! | `DELETE /mcp` | close a single-shot session |
//! | `GET /health`, `/status`, `/metrics`, `/metrics/prometheus`, `/events` | operations |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::application::gateway::Gateway;
use crate::application::session_registry::SessionRegistry;
use crate::domain::protocol::{methods, JsonRpcRequest, JsonRpcResponse};
use crate::domain::session::{ClientMetadata, SessionId};
use crate::infrastructure::event_bus::EventBusError;

/// Header carrying the session id on correlated and single-shot requests.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// How many recent failures `/metrics` reports.
const RECENT_ERRORS: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn app(gateway: Arc<Gateway>, prometheus: Option<PrometheusHandle>) -> Router {
    let state = Arc::new(AppState { gateway, prometheus });

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/prometheus", get(prometheus_handler))
        .route("/events", get(events_handler))
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .route("/mcp", post(mcp_post_handler).delete(mcp_delete_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Extractors ─────────────────────────────────────────────────────────────

/// Client metadata taken from the request: user agent and peer address.
pub struct ClientOrigin(pub ClientMetadata);

impl<S: Send + Sync> FromRequestParts<S> for ClientOrigin {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let client_id = parts
            .headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let origin = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.to_string())
            });
        Ok(ClientOrigin(ClientMetadata::new(client_id, origin)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: Option<String>,
}

fn header_session(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn with_session_header(mut response: Response, session_id: SessionId) -> Response {
    if let Ok(value) = HeaderValue::from_str(&session_id.to_string()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// Unregisters its session when dropped, unless closed explicitly first.
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    armed: bool,
}

impl SessionGuard {
    fn new(registry: Arc<SessionRegistry>, session_id: SessionId) -> Self {
        Self {
            registry,
            session_id,
            armed: true,
        }
    }

    async fn close(mut self) {
        self.armed = false;
        self.registry.unregister(self.session_id).await;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.registry.detach_channel(self.session_id);
        let registry = self.registry.clone();
        let session_id = self.session_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.unregister(session_id).await;
            });
        }
    }
}

// ─── Operational ────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.gateway.uptime_seconds(),
    }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.gateway.status()).into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let errors = state.gateway.error_handler();
    Json(json!({
        "health": errors.health_metrics(),
        "circuitBreakers": errors.breaker_snapshots(),
        "recentErrors": errors.error_history(RECENT_ERRORS),
    }))
}

async fn prometheus_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => error_response(StatusCode::NOT_FOUND, "prometheus exporter is disabled"),
    }
}

/// Operator stream of every gateway event.
async fn events_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut events = state.gateway.event_bus().subscribe();
    let stream = async_stream::stream! {
        loop {
            match events.recv().await {
                Ok(event) => match Event::default().event("gateway_event").json_data(&event) {
                    Ok(sse) => yield Ok::<_, Infallible>(sse),
                    Err(e) => warn!("Failed to encode gateway event: {}", e),
                },
                Err(EventBusError::Lagged(_)) | Err(EventBusError::Empty) => continue,
                Err(EventBusError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

// ─── Persistent channel ─────────────────────────────────────────────────────

async fn sse_handler(State(state): State<Arc<AppState>>, ClientOrigin(metadata): ClientOrigin) -> Response {
    let registry = state.gateway.registry().clone();
    let session_id = registry.connect(metadata);
    let mut outbound = match registry.attach_channel(session_id) {
        Ok(rx) => rx,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let guard = SessionGuard::new(registry, session_id);
    let endpoint = format!("/messages?sessionId={}", session_id);

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint));
        while let Some(message) = outbound.recv().await {
            match Event::default().event("message").json_data(&message) {
                Ok(sse) => yield Ok(sse),
                Err(e) => warn!(session_id = %session_id, "Failed to encode outbound message: {}", e),
            }
        }
    };

    with_session_header(
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response(),
        session_id,
    )
}

async fn messages_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session_id) = query
        .session_id
        .as_deref()
        .or_else(|| header_session(&headers))
        .and_then(|raw| raw.parse::<SessionId>().ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, "missing or invalid session id");
    };

    let registry = state.gateway.registry().clone();
    if !registry.contains(session_id) {
        return error_response(StatusCode::NOT_FOUND, format!("session {} not found", session_id));
    }

    let request = match JsonRpcRequest::parse(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(JsonRpcResponse::failure(Value::Null, e))).into_response(),
    };

    tokio::spawn(async move {
        match registry.dispatch(session_id, request).await {
            Ok(Some(response)) => {
                if let Err(e) = registry.send_response(session_id, response) {
                    debug!(session_id = %session_id, "Dropping response: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => debug!(session_id = %session_id, "Dispatch failed: {}", e),
        }
    });

    StatusCode::ACCEPTED.into_response()
}

// ─── Single-shot channel ────────────────────────────────────────────────────

async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    ClientOrigin(metadata): ClientOrigin,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match JsonRpcRequest::parse(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(JsonRpcResponse::failure(Value::Null, e))).into_response(),
    };
    let registry = state.gateway.registry().clone();

    let known = match header_session(&headers) {
        Some(raw) => match raw.parse::<SessionId>() {
            Ok(id) if registry.contains(id) => Some(id),
            Ok(id) => return error_response(StatusCode::NOT_FOUND, format!("session {} not found", id)),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid session id"),
        },
        None => None,
    };

    let (session_id, issued, ephemeral) = match known {
        Some(id) => (id, false, None),
        None if request.method == methods::INITIALIZE => (registry.connect(metadata), true, None),
        None => {
            let id = registry.connect(metadata.ephemeral());
            (id, false, Some(SessionGuard::new(registry.clone(), id)))
        }
    };

    let dispatched = registry.dispatch(session_id, request).await;
    if let Some(guard) = ephemeral {
        guard.close().await;
    }

    let response = match dispatched {
        Ok(Some(response)) => Json(response).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => return error_response(StatusCode::NOT_FOUND, e.to_string()),
    };
    if issued {
        with_session_header(response, session_id)
    } else {
        response
    }
}

async fn mcp_delete_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_session(&headers).and_then(|raw| raw.parse::<SessionId>().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing or invalid session id");
    };
    if state.gateway.registry().unregister(session_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("session {} not found", session_id))
    }
}
