// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Gateway composition root
//!
//! Builds the service graph from a [`GatewayConfigManifest`]: event bus,
//! error handler, tool registry and invocation service, session registry,
//! coordinator. Owns the explicit `start`/`stop` lifecycle.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Dependency injection and lifecycle for the gateway services

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::application::coordinator::{CoordinatorStats, CrossSessionCoordinator};
use crate::application::session_handler::{GatewaySessionHandlerFactory, ServerInfo};
use crate::application::session_registry::{ListenerId, RegistryStats, SessionRegistry};
use crate::application::tool_invocation_service::ToolInvocationService;
use crate::domain::gateway_config::GatewayConfigManifest;
use crate::domain::tool::Tool;
use crate::infrastructure::collaborators::Collaborators;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::http_tool::HttpTool;
use crate::infrastructure::resilience::ErrorHandler;
use crate::infrastructure::tool_registry::ToolRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub name: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub sessions: RegistryStats,
    pub coordination: CoordinatorStats,
    pub tools: usize,
}

/// Builder for [`Gateway`]. Extra tools and collaborators replace or extend
/// what the manifest describes.
pub struct GatewayBuilder {
    config: GatewayConfigManifest,
    tools: Vec<Arc<dyn Tool>>,
    collaborators: Option<Collaborators>,
    event_bus: Option<EventBus>,
    server_info: ServerInfo,
}

impl GatewayBuilder {
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_server_info(mut self, server_info: ServerInfo) -> Self {
        self.server_info = server_info;
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let spec = &self.config.spec;
        let event_bus = self.event_bus.unwrap_or_default();
        let error_handler = Arc::new(ErrorHandler::new(&spec.resilience).with_event_bus(event_bus.clone()));

        let request_timeout = spec.resilience.circuit_breaker.call_timeout;
        let client = reqwest::Client::builder()
            .user_agent(concat!("mcp-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let tool_registry = Arc::new(ToolRegistry::new());
        for tool in &spec.tools {
            tool_registry
                .register(Arc::new(HttpTool::new(tool, client.clone(), request_timeout)))
                .with_context(|| format!("Failed to register tool '{}'", tool.name))?;
        }
        for tool in self.tools {
            let name = tool.descriptor().name;
            tool_registry
                .register(tool)
                .with_context(|| format!("Failed to register tool '{}'", name))?;
        }

        let tools = Arc::new(ToolInvocationService::new(tool_registry, error_handler.clone()));
        let collaborators = self
            .collaborators
            .unwrap_or_else(|| Collaborators::from_config(&spec.collaborators, client, request_timeout));

        let queue_capacity = spec.sessions.notification_queue_capacity;
        let coordination = spec.coordination.clone();
        let server_info = self.server_info;
        let coordinator = Arc::new_cyclic(|weak| {
            let factory = Arc::new(GatewaySessionHandlerFactory::new(weak.clone(), tools.clone(), server_info));
            let registry = Arc::new(SessionRegistry::new(factory, queue_capacity, event_bus.clone()));
            CrossSessionCoordinator::new(
                registry,
                tools.clone(),
                error_handler.clone(),
                collaborators,
                coordination,
                event_bus.clone(),
            )
        });
        let registry = coordinator.registry().clone();
        let listener = registry.add_listener(coordinator.clone());

        Ok(Gateway {
            config: self.config,
            registry,
            coordinator,
            tools,
            error_handler,
            event_bus,
            listener: Mutex::new(Some(listener)),
            started_at: Instant::now(),
        })
    }
}

pub struct Gateway {
    config: GatewayConfigManifest,
    registry: Arc<SessionRegistry>,
    coordinator: Arc<CrossSessionCoordinator>,
    tools: Arc<ToolInvocationService>,
    error_handler: Arc<ErrorHandler>,
    event_bus: EventBus,
    listener: Mutex<Option<ListenerId>>,
    started_at: Instant,
}

impl Gateway {
    pub fn builder(config: GatewayConfigManifest) -> GatewayBuilder {
        GatewayBuilder {
            config,
            tools: Vec::new(),
            collaborators: None,
            event_bus: None,
            server_info: ServerInfo::default(),
        }
    }

    /// Gateway wired exactly as the manifest describes.
    pub fn from_config(config: GatewayConfigManifest) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start background work (the coordination sweep).
    pub fn start(&self) {
        self.coordinator.start_sweep();
        info!(
            name = %self.config.metadata.name,
            tools = self.tools.descriptors().len(),
            "Gateway started"
        );
    }

    /// Close every session (running the full disconnect cascade), then stop
    /// the sweep and detach the coordinator from the registry.
    pub async fn stop(&self) {
        info!("Stopping gateway");
        self.registry.shutdown().await;
        self.coordinator.stop_sweep().await;
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            self.registry.remove_listener(listener);
        }
        info!("Gateway stopped");
    }

    pub fn config(&self) -> &GatewayConfigManifest {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<CrossSessionCoordinator> {
        &self.coordinator
    }

    pub fn tools(&self) -> &Arc<ToolInvocationService> {
        &self.tools
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.error_handler
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            name: self.config.metadata.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.uptime_seconds(),
            sessions: self.registry.stats(),
            coordination: self.coordinator.stats(),
            tools: self.tools.descriptors().len(),
        }
    }
}
