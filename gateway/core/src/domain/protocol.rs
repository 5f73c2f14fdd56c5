// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! JSON-RPC 2.0 message types used by both transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::notification::{Notification, NOTIFICATION_METHOD};

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision advertised during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── Methods ────────────────────────────────────────────────────────────────

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    /// The fire-and-forget "ready" notification.
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

// ─── Error codes ────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Request aborted because the session went away or the client cancelled it.
    pub const REQUEST_CANCELLED: i32 = -32800;
}

/// Inbound request or notification (a notification has no `id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Parse and validate a raw message body.
    pub fn parse(body: &[u8]) -> Result<Self, JsonRpcError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| JsonRpcError::new(error_codes::PARSE_ERROR, format!("Parse error: {}", e)))?;
        let request: Self = serde_json::from_value(value)
            .map_err(|e| JsonRpcError::new(error_codes::INVALID_REQUEST, format!("Invalid request: {}", e)))?;
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(JsonRpcError::new(
                error_codes::INVALID_REQUEST,
                format!("Unsupported jsonrpc version '{}'", request.jsonrpc),
            ));
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(error_codes::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn cancelled() -> Self {
        Self::new(error_codes::REQUEST_CANCELLED, "Request cancelled")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Anything the server pushes down a persistent channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Response(JsonRpcResponse),
    Notification(JsonRpcRequest),
}

impl From<&Notification> for OutboundMessage {
    fn from(notification: &Notification) -> Self {
        Self::Notification(JsonRpcRequest::notification(
            NOTIFICATION_METHOD,
            serde_json::to_value(notification).ok(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_and_notification() {
        let req = JsonRpcRequest::parse(br#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#).unwrap();
        assert_eq!(req.id, Some(json!(7)));
        assert!(!req.is_notification());

        let ready = JsonRpcRequest::parse(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(ready.is_notification());
    }

    #[test]
    fn test_parse_errors() {
        let err = JsonRpcRequest::parse(b"{not json").unwrap_err();
        assert_eq!(err.code, error_codes::PARSE_ERROR);

        let err = JsonRpcRequest::parse(br#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_REQUEST);

        let err = JsonRpcRequest::parse(br#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_response_serialization_omits_empty_fields() {
        let ok = serde_json::to_value(JsonRpcResponse::success(json!(1), json!({}))).unwrap();
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(JsonRpcResponse::failure(json!(2), JsonRpcError::cancelled())).unwrap();
        assert!(err.get("result").is_none());
        assert_eq!(err["error"]["code"], json!(error_codes::REQUEST_CANCELLED));
    }
}
