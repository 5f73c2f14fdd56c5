// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Downstream collaborators that execute approved operations.
//!
//! Each collaborator is an opaque call: the coordinator hands it the validated
//! payload and gets back a JSON result or an error. Classification of that
//! error is the resilience layer's job.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::operation::{CoordinatedUpdate, Generation, OperationId, Rollback};
use crate::domain::session::SessionId;

pub const UPDATE_ORCHESTRATOR: &str = "update-orchestrator";
pub const GENERATION_SERVICE: &str = "generation-service";
pub const ROLLBACK_MANAGER: &str = "rollback-manager";

/// Rolls a coordinated update out to the affected sessions' targets.
#[async_trait]
pub trait UpdateOrchestrator: Send + Sync {
    async fn apply_update(
        &self,
        operation_id: OperationId,
        update: &CoordinatedUpdate,
        affected_sessions: &[SessionId],
    ) -> anyhow::Result<Value>;
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, operation_id: OperationId, generation: &Generation) -> anyhow::Result<Value>;
}

/// Undoes previously dispatched work. Cancellation never does this implicitly.
#[async_trait]
pub trait RollbackManager: Send + Sync {
    async fn rollback(&self, operation_id: OperationId, rollback: &Rollback) -> anyhow::Result<Value>;
}
