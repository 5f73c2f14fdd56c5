// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Tool
//!
//! Uniform contract for every remotely-callable capability. The concrete
//! version-control, pipeline, container and VM drivers sit behind [`Tool`];
//! the gateway only sees the descriptor, the dependency key used for
//! resilience bookkeeping, and the result or failure of `invoke`.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Tool contract and MCP result shape

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::failure::ClassifiedError;
use crate::domain::session::SessionId;

/// Name, description and JSON input schema, as listed by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Per-call context handed to a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolContext {
    pub session_id: SessionId,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Key of the downstream dependency this tool calls (one circuit breaker per key).
    fn dependency_key(&self) -> &str;

    async fn invoke(&self, ctx: &ToolContext, arguments: Value) -> anyhow::Result<Value>;
}

/// `tools/call` result in MCP shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

impl ToolCallResult {
    pub fn success(value: Value) -> Self {
        let text = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            content: vec![ToolContent::Text { text }],
            structured_content: Some(value),
            is_error: false,
        }
    }

    /// A classified failure: category, severity and strategy travel with the message.
    pub fn classified_failure(error: &ClassifiedError) -> Self {
        Self {
            content: vec![ToolContent::Text { text: error.to_string() }],
            structured_content: Some(json!({
                "category": error.category,
                "severity": error.severity,
                "strategy": error.strategy,
                "message": error.message,
                "dependency": error.dependency,
                "attempts": error.attempts,
            })),
            is_error: true,
        }
    }

    /// A failure that did not come from a downstream dependency.
    pub fn failure(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            content: vec![ToolContent::Text { text: message.clone() }],
            structured_content: Some(json!({ "error": kind, "message": message })),
            is_error: true,
        }
    }
}
