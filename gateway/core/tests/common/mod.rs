// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mcp_gateway_core::application::Gateway;
use mcp_gateway_core::domain::collaborators::{GenerationService, RollbackManager, UpdateOrchestrator};
use mcp_gateway_core::domain::gateway_config::GatewayConfigManifest;
use mcp_gateway_core::domain::operation::{CoordinatedUpdate, Generation, OperationId, Rollback};
use mcp_gateway_core::domain::session::SessionId;
use mcp_gateway_core::infrastructure::Collaborators;

/// Collaborator that fails the first `failures` calls with `message`, then succeeds.
pub struct ScriptedCollaborator {
    pub calls: AtomicU32,
    failures: u32,
    message: String,
}

impl ScriptedCollaborator {
    pub fn succeeding() -> Arc<Self> {
        Self::failing(0, "")
    }

    pub fn failing(failures: u32, message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures,
            message: message.to_string(),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self, result: Value) -> anyhow::Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            anyhow::bail!("{}", self.message);
        }
        Ok(result)
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            updates: self.clone(),
            generation: self.clone(),
            rollbacks: self.clone(),
        }
    }
}

#[async_trait]
impl UpdateOrchestrator for ScriptedCollaborator {
    async fn apply_update(&self, _: OperationId, update: &CoordinatedUpdate, _: &[SessionId]) -> anyhow::Result<Value> {
        self.next(json!({ "target": update.target, "version": update.version }))
    }
}

#[async_trait]
impl GenerationService for ScriptedCollaborator {
    async fn generate(&self, _: OperationId, generation: &Generation) -> anyhow::Result<Value> {
        self.next(json!({ "artifact": format!("{}.yaml", generation.target) }))
    }
}

#[async_trait]
impl RollbackManager for ScriptedCollaborator {
    async fn rollback(&self, _: OperationId, rollback: &Rollback) -> anyhow::Result<Value> {
        self.next(json!({ "restored": rollback.to_version }))
    }
}

/// Default manifest without downstream tools, with short retry delays.
pub fn config() -> GatewayConfigManifest {
    let mut config = GatewayConfigManifest::default();
    config.spec.resilience.retry.base_delay = Duration::from_millis(10);
    config.spec.resilience.retry.max_delay = Duration::from_millis(100);
    config
}

pub fn gateway(collaborator: &Arc<ScriptedCollaborator>) -> Arc<Gateway> {
    Arc::new(
        Gateway::builder(config())
            .with_collaborators(collaborator.collaborators())
            .build()
            .expect("gateway builds"),
    )
}
