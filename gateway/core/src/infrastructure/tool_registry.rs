// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tool Registry
//!
//! Catalogue of downstream tools, keyed by name, with each tool's input
//! schema compiled once at registration.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Tool lookup and argument validation for dispatch

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

use crate::domain::tool::{Tool, ToolDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum ToolRegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("tool '{tool}' has an invalid input schema: {message}")]
    InvalidSchema { tool: String, message: String },
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    descriptor: ToolDescriptor,
    validator: Arc<jsonschema::Validator>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolRegistryError> {
        let descriptor = tool.descriptor();
        let validator = jsonschema::validator_for(&descriptor.input_schema).map_err(|e| {
            ToolRegistryError::InvalidSchema {
                tool: descriptor.name.clone(),
                message: e.to_string(),
            }
        })?;

        let mut tools = self.tools.write();
        if tools.contains_key(&descriptor.name) {
            return Err(ToolRegistryError::DuplicateTool(descriptor.name));
        }
        info!(tool = %descriptor.name, dependency = %tool.dependency_key(), "Registered tool");
        tools.insert(
            descriptor.name.clone(),
            RegisteredTool {
                tool,
                descriptor,
                validator: Arc::new(validator),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).map(|t| t.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Descriptors sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.read().values().map(|t| t.descriptor.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Check `arguments` against the tool's input schema. Returns every violation.
    /// Unknown tools pass; lookup failures are reported by the caller.
    pub fn validate_arguments(&self, name: &str, arguments: &Value) -> Result<(), Vec<String>> {
        let Some(validator) = self.tools.read().get(name).map(|t| t.validator.clone()) else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(arguments)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tool::ToolContext;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new(
                "echo",
                "Echo the arguments back",
                json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            )
        }

        fn dependency_key(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, _ctx: &ToolContext, arguments: Value) -> anyhow::Result<Value> {
            Ok(arguments)
        }
    }

    #[test]
    fn test_register_and_validate() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        assert!(registry.contains("echo"));
        assert_eq!(registry.descriptors()[0].name, "echo");

        assert!(registry.validate_arguments("echo", &json!({"text": "hi"})).is_ok());
        let errors = registry.validate_arguments("echo", &json!({"text": 4})).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(registry.validate_arguments("echo", &json!({})).is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Echo)),
            Err(ToolRegistryError::DuplicateTool(_))
        ));
        assert_eq!(registry.len(), 1);
    }
}
