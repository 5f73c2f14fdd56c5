// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP implementations of the operation collaborators, plus a stand-in for
//! collaborators that have no endpoint configured.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::domain::collaborators::{
    GenerationService, RollbackManager, UpdateOrchestrator, GENERATION_SERVICE, ROLLBACK_MANAGER,
    UPDATE_ORCHESTRATOR,
};
use crate::domain::gateway_config::CollaboratorsConfig;
use crate::domain::operation::{CoordinatedUpdate, Generation, OperationId, Rollback};
use crate::domain::session::SessionId;
use crate::infrastructure::http_tool::post_json;

/// Collaborator reached by POSTing JSON to a fixed endpoint.
pub struct HttpCollaborator {
    name: &'static str,
    endpoint: String,
    request_timeout: Duration,
    client: Client,
}

impl HttpCollaborator {
    pub fn new(name: &'static str, endpoint: impl Into<String>, client: Client, request_timeout: Duration) -> Self {
        Self {
            name,
            endpoint: endpoint.into(),
            request_timeout,
            client,
        }
    }

    async fn post(&self, body: Value) -> Result<Value> {
        post_json(&self.client, &self.endpoint, &body, self.request_timeout)
            .await
            .with_context(|| format!("{} at {}", self.name, self.endpoint))
    }
}

#[async_trait]
impl UpdateOrchestrator for HttpCollaborator {
    async fn apply_update(
        &self,
        operation_id: OperationId,
        update: &CoordinatedUpdate,
        affected_sessions: &[SessionId],
    ) -> Result<Value> {
        self.post(json!({
            "operationId": operation_id,
            "update": update,
            "affectedSessions": affected_sessions,
        }))
        .await
    }
}

#[async_trait]
impl GenerationService for HttpCollaborator {
    async fn generate(&self, operation_id: OperationId, generation: &Generation) -> Result<Value> {
        self.post(json!({ "operationId": operation_id, "generation": generation })).await
    }
}

#[async_trait]
impl RollbackManager for HttpCollaborator {
    async fn rollback(&self, operation_id: OperationId, rollback: &Rollback) -> Result<Value> {
        self.post(json!({ "operationId": operation_id, "rollback": rollback })).await
    }
}

/// Fails every call with a configuration error.
pub struct UnconfiguredCollaborator {
    name: &'static str,
}

impl UnconfiguredCollaborator {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    fn error(&self) -> anyhow::Error {
        anyhow::anyhow!("{} is not configured", self.name)
    }
}

#[async_trait]
impl UpdateOrchestrator for UnconfiguredCollaborator {
    async fn apply_update(&self, _: OperationId, _: &CoordinatedUpdate, _: &[SessionId]) -> Result<Value> {
        Err(self.error())
    }
}

#[async_trait]
impl GenerationService for UnconfiguredCollaborator {
    async fn generate(&self, _: OperationId, _: &Generation) -> Result<Value> {
        Err(self.error())
    }
}

#[async_trait]
impl RollbackManager for UnconfiguredCollaborator {
    async fn rollback(&self, _: OperationId, _: &Rollback) -> Result<Value> {
        Err(self.error())
    }
}

/// The three collaborators the coordinator dispatches to.
#[derive(Clone)]
pub struct Collaborators {
    pub updates: Arc<dyn UpdateOrchestrator>,
    pub generation: Arc<dyn GenerationService>,
    pub rollbacks: Arc<dyn RollbackManager>,
}

impl Collaborators {
    /// HTTP collaborators for every configured endpoint, unconfigured stand-ins otherwise.
    pub fn from_config(config: &CollaboratorsConfig, client: Client, request_timeout: Duration) -> Self {
        Self {
            updates: match &config.update_orchestrator {
                Some(url) => Arc::new(HttpCollaborator::new(UPDATE_ORCHESTRATOR, url, client.clone(), request_timeout)),
                None => Arc::new(UnconfiguredCollaborator::new(UPDATE_ORCHESTRATOR)),
            },
            generation: match &config.generation_service {
                Some(url) => Arc::new(HttpCollaborator::new(GENERATION_SERVICE, url, client.clone(), request_timeout)),
                None => Arc::new(UnconfiguredCollaborator::new(GENERATION_SERVICE)),
            },
            rollbacks: match &config.rollback_manager {
                Some(url) => Arc::new(HttpCollaborator::new(ROLLBACK_MANAGER, url, client, request_timeout)),
                None => Arc::new(UnconfiguredCollaborator::new(ROLLBACK_MANAGER)),
            },
        }
    }

    pub fn unconfigured() -> Self {
        Self::from_config(&CollaboratorsConfig::default(), Client::new(), Duration::from_secs(30))
    }
}
