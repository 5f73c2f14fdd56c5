// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP-backed downstream tool.
//!
//! The gateway POSTs `{tool, arguments, sessionId}` to the tool's endpoint and
//! returns the JSON body. A non-2xx status becomes an error whose message
//! starts with the status line so the classifier can categorise it.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::domain::gateway_config::ToolConfig;
use crate::domain::tool::{Tool, ToolContext, ToolDescriptor};

/// Bodies longer than this are cut from error messages.
const MAX_ERROR_BODY: usize = 512;

pub struct HttpTool {
    descriptor: ToolDescriptor,
    dependency: String,
    endpoint: String,
    request_timeout: Duration,
    client: Client,
}

impl HttpTool {
    pub fn new(config: &ToolConfig, client: Client, request_timeout: Duration) -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                config.name.clone(),
                config.description.clone(),
                config.input_schema.clone(),
            ),
            dependency: config.dependency_key().to_string(),
            endpoint: config.endpoint.clone(),
            request_timeout,
            client,
        }
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    fn dependency_key(&self) -> &str {
        &self.dependency
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: Value) -> Result<Value> {
        let body = json!({
            "tool": self.descriptor.name,
            "arguments": arguments,
            "sessionId": ctx.session_id,
        });
        post_json(&self.client, &self.endpoint, &body, self.request_timeout)
            .await
            .with_context(|| format!("tool '{}' at {}", self.descriptor.name, self.endpoint))
    }
}

/// POST `body` and decode the JSON response, mapping non-2xx to an error.
pub(crate) async fn post_json(client: &Client, url: &str, body: &Value, timeout: Duration) -> Result<Value> {
    let response = client.post(url).timeout(timeout).json(body).send().await?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let snippet: String = text.chars().take(MAX_ERROR_BODY).collect();
        anyhow::bail!("HTTP {}: {}", status, snippet.trim());
    }

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::failure::ErrorCategory;
    use crate::domain::session::SessionId;
    use crate::infrastructure::resilience::ErrorClassifier;

    fn tool(endpoint: String) -> HttpTool {
        HttpTool::new(
            &ToolConfig {
                name: "git_status".to_string(),
                description: "status".to_string(),
                input_schema: json!({"type": "object"}),
                endpoint,
                dependency: Some("git".to_string()),
            },
            Client::new(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_posts_envelope_and_returns_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tools")
            .match_body(mockito::Matcher::PartialJson(json!({
                "tool": "git_status",
                "arguments": {"repository": "platform-api"}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"branch":"main","clean":true}"#)
            .create_async()
            .await;

        let t = tool(format!("{}/tools", server.url()));
        assert_eq!(t.dependency_key(), "git");
        let ctx = ToolContext { session_id: SessionId::new() };
        let result = t.invoke(&ctx, json!({"repository": "platform-api"})).await.unwrap();

        assert_eq!(result["branch"], json!("main"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_classifiable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tools")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let t = tool(format!("{}/tools", server.url()));
        let ctx = ToolContext { session_id: SessionId::new() };
        let err = t.invoke(&ctx, json!({})).await.unwrap_err();

        let classified = ErrorClassifier::classify(&err, "git_status", "git");
        assert_eq!(classified.category, ErrorCategory::DependencyUnavailable);
        assert!(classified.message.contains("503 Service Unavailable"));
    }
}
