// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Dispatches downstream tool calls: looks the tool up, checks the arguments
//! against its input schema, then runs it through the resilience layer under
//! the tool's dependency key.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::domain::failure::{ClassifiedError, ErrorCategory};
use crate::domain::session::SessionId;
use crate::domain::tool::{ToolContext, ToolDescriptor};
use crate::infrastructure::resilience::ErrorHandler;
use crate::infrastructure::tool_registry::ToolRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ToolInvocationError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error(transparent)]
    Failed(#[from] ClassifiedError),
}

pub struct ToolInvocationService {
    tools: Arc<ToolRegistry>,
    error_handler: Arc<ErrorHandler>,
}

impl ToolInvocationService {
    pub fn new(tools: Arc<ToolRegistry>, error_handler: Arc<ErrorHandler>) -> Self {
        Self { tools, error_handler }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.descriptors()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains(name)
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.error_handler
    }

    /// Invoke `name` on behalf of `session_id`.
    ///
    /// Schema violations are `validation` failures: recorded, never retried.
    pub async fn invoke(
        &self,
        session_id: SessionId,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ToolInvocationError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolInvocationError::UnknownTool(name.to_string()))?;
        let dependency = tool.dependency_key().to_string();

        let arguments = if arguments.is_null() { json!({}) } else { arguments };

        if let Err(violations) = self.tools.validate_arguments(name, &arguments) {
            let err = ClassifiedError::new(
                ErrorCategory::Validation,
                format!("invalid arguments: {}", violations.join("; ")),
                name,
                dependency,
            );
            self.error_handler.record_failure(&err);
            return Err(err.into());
        }

        let ctx = ToolContext { session_id };
        let value = self
            .error_handler
            .execute(name, &dependency, || {
                let tool = tool.clone();
                let arguments = arguments.clone();
                async move { tool.invoke(&ctx, arguments).await }
            })
            .await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateway_config::ResilienceConfig;
    use crate::domain::tool::Tool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        message: &'static str,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new(
                "deploy_status",
                "Pipeline status",
                json!({
                    "type": "object",
                    "properties": { "pipeline": { "type": "string" } },
                    "required": ["pipeline"]
                }),
            )
        }

        fn dependency_key(&self) -> &str {
            "pipeline"
        }

        async fn invoke(&self, _ctx: &ToolContext, arguments: Value) -> anyhow::Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                anyhow::bail!("{}", self.message);
            }
            Ok(json!({ "pipeline": arguments["pipeline"], "state": "green" }))
        }
    }

    fn service(tool: Arc<Flaky>) -> ToolInvocationService {
        let mut config = ResilienceConfig::default();
        config.retry.base_delay = Duration::from_millis(10);
        config.circuit_breaker.enabled = false;
        let registry = Arc::new(ToolRegistry::new());
        registry.register(tool).unwrap();
        ToolInvocationService::new(registry, Arc::new(ErrorHandler::new(&config)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let tool = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures: 1,
            message: "connection reset by peer",
        });
        let svc = service(tool.clone());

        let value = svc
            .invoke(SessionId::new(), "deploy_status", json!({"pipeline": "api"}))
            .await
            .unwrap();
        assert_eq!(value["state"], json!("green"));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_schema_violation_is_not_dispatched() {
        let tool = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures: 0,
            message: "",
        });
        let svc = service(tool.clone());

        let err = svc.invoke(SessionId::new(), "deploy_status", Value::Null).await.unwrap_err();
        match err {
            ToolInvocationError::Failed(e) => {
                assert_eq!(e.category, ErrorCategory::Validation);
                assert_eq!(e.attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert_eq!(svc.error_handler().health_metrics().total_failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let tool = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures: 0,
            message: "",
        });
        let svc = service(tool);
        assert!(matches!(
            svc.invoke(SessionId::new(), "nope", json!({})).await,
            Err(ToolInvocationError::UnknownTool(name)) if name == "nope"
        ));
    }
}
