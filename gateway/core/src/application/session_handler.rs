// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Per-session MCP protocol handler
//!
//! Every session owns one [`GatewaySessionHandler`]. It answers the
//! handshake, lists tools and runs tool calls, tracking each call so that it
//! can be cancelled individually (`notifications/cancelled`) or in bulk when
//! the session goes away.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** JSON-RPC method handling scoped to a single session

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::coordination_tools;
use crate::application::coordinator::{CoordinationError, CrossSessionCoordinator};
use crate::application::session_registry::{SessionHandler, SessionHandlerFactory};
use crate::application::tool_invocation_service::{ToolInvocationError, ToolInvocationService};
use crate::domain::protocol::{
    error_codes, methods, JsonRpcError, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
};
use crate::domain::session::SessionId;
use crate::domain::tool::{ToolCallResult, ToolDescriptor};

/// `serverInfo` advertised during `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "mcp-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct HandshakeState {
    ready: bool,
    client_info: Option<Value>,
    protocol_version: Option<String>,
}

#[derive(Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelParams {
    request_id: Value,
}

pub struct GatewaySessionHandler {
    session_id: SessionId,
    coordinator: Weak<CrossSessionCoordinator>,
    tools: Arc<ToolInvocationService>,
    server_info: ServerInfo,
    handshake: Mutex<HandshakeState>,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    root: CancellationToken,
}

impl GatewaySessionHandler {
    pub fn new(
        session_id: SessionId,
        coordinator: Weak<CrossSessionCoordinator>,
        tools: Arc<ToolInvocationService>,
        server_info: ServerInfo,
    ) -> Self {
        Self {
            session_id,
            coordinator,
            tools,
            server_info,
            handshake: Mutex::new(HandshakeState::default()),
            in_flight: Mutex::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether the client sent the "ready" notification.
    pub fn is_ready(&self) -> bool {
        self.handshake.lock().ready
    }

    pub fn client_info(&self) -> Option<Value> {
        self.handshake.lock().client_info.clone()
    }

    fn initialize(&self, params: Option<Value>) -> Value {
        let params = params.unwrap_or(Value::Null);
        {
            let mut handshake = self.handshake.lock();
            handshake.client_info = params.get("clientInfo").cloned();
            handshake.protocol_version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        let client = params
            .pointer("/clientInfo/name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        info!(session_id = %self.session_id, client, "Session initialized");
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": self.server_info,
        })
    }

    fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = self.tools.descriptors();
        tools.extend(coordination_tools::descriptors());
        tools
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            methods::INITIALIZED => {
                self.handshake.lock().ready = true;
                debug!(session_id = %self.session_id, "Client ready");
            }
            methods::CANCELLED => {
                let Some(params) = params.and_then(|p| serde_json::from_value::<CancelParams>(p).ok()) else {
                    debug!(session_id = %self.session_id, "Ignoring malformed cancel notification");
                    return;
                };
                let key = params.request_id.to_string();
                if let Some(token) = self.in_flight.lock().get(&key) {
                    info!(session_id = %self.session_id, request_id = %key, "Cancelling in-flight call");
                    token.cancel();
                }
            }
            other => {
                debug!(session_id = %self.session_id, method = %other, "Ignoring unknown notification");
            }
        }
    }

    /// Run a `tools/call`, tracked under its request id until it finishes.
    /// An id already in flight on this session is refused.
    async fn tracked_call(&self, request_id: &Value, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let token = self.root.child_token();
        let key = request_id.to_string();
        match self.in_flight.lock().entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(JsonRpcError::new(
                    error_codes::INVALID_REQUEST,
                    format!("request id {} is already in flight", key),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        let _untrack = scopeguard::guard(key, |key| {
            self.in_flight.lock().remove(&key);
        });

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(JsonRpcError::cancelled()),
            result = self.call_tool(params) => result,
        }
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: CallParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
        debug!(session_id = %self.session_id, tool = %params.name, "Tool call");

        let result = if coordination_tools::is_coordination_tool(&params.name) {
            self.call_coordination_tool(&params.name, params.arguments).await?
        } else {
            match self.tools.invoke(self.session_id, &params.name, params.arguments).await {
                Ok(value) => ToolCallResult::success(value),
                Err(ToolInvocationError::UnknownTool(name)) => {
                    return Err(JsonRpcError::invalid_params(format!("unknown tool '{}'", name)));
                }
                Err(ToolInvocationError::Failed(e)) => ToolCallResult::classified_failure(&e),
            }
        };

        serde_json::to_value(result)
            .map_err(|e| JsonRpcError::new(error_codes::INTERNAL_ERROR, e.to_string()))
    }

    async fn call_coordination_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, JsonRpcError> {
        if !coordination_tools::descriptors().iter().any(|d| d.name == name) {
            return Err(JsonRpcError::invalid_params(format!("unknown tool '{}'", name)));
        }
        let coordinator = self
            .coordinator
            .upgrade()
            .ok_or_else(|| JsonRpcError::new(error_codes::INTERNAL_ERROR, "coordinator is not running"))?;

        Ok(
            match coordination_tools::dispatch(&coordinator, self.session_id, name, arguments).await {
                Ok(value) => ToolCallResult::success(value),
                Err(CoordinationError::Execution(e)) => ToolCallResult::classified_failure(&e),
                Err(e) => ToolCallResult::failure(e.code(), e.to_string()),
            },
        )
    }
}

#[async_trait]
impl SessionHandler for GatewaySessionHandler {
    async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let JsonRpcRequest { id, method, params, .. } = request;

        let Some(id) = id else {
            self.handle_notification(&method, params);
            return None;
        };

        let result = match method.as_str() {
            methods::INITIALIZE => Ok(self.initialize(params)),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(json!({ "tools": self.list_tools() })),
            methods::TOOLS_CALL => self.tracked_call(&id, params).await,
            other => Err(JsonRpcError::method_not_found(other)),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }

    fn cancel_all(&self) -> usize {
        let count = self.in_flight.lock().len();
        self.root.cancel();
        count
    }

    fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Builds one [`GatewaySessionHandler`] per registered session.
pub struct GatewaySessionHandlerFactory {
    coordinator: Weak<CrossSessionCoordinator>,
    tools: Arc<ToolInvocationService>,
    server_info: ServerInfo,
}

impl GatewaySessionHandlerFactory {
    pub fn new(
        coordinator: Weak<CrossSessionCoordinator>,
        tools: Arc<ToolInvocationService>,
        server_info: ServerInfo,
    ) -> Self {
        Self {
            coordinator,
            tools,
            server_info,
        }
    }
}

impl SessionHandlerFactory for GatewaySessionHandlerFactory {
    fn create(&self, session_id: SessionId) -> Arc<dyn SessionHandler> {
        Arc::new(GatewaySessionHandler::new(
            session_id,
            self.coordinator.clone(),
            self.tools.clone(),
            self.server_info.clone(),
        ))
    }
}
