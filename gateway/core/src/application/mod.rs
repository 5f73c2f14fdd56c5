// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application
//!
//! Services built on the domain model: the session registry and transport
//! multiplexer, per-session protocol handlers, tool invocation, the
//! cross-session coordinator and the composition root that wires them.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Use cases and service lifecycle

pub mod coordination_sweeper;
pub mod coordination_tools;
pub mod coordinator;
pub mod gateway;
pub mod session_handler;
pub mod session_registry;
pub mod tool_invocation_service;

pub use coordinator::{CoordinationError, CrossSessionCoordinator};
pub use gateway::{Gateway, GatewayBuilder, GatewayStatus};
pub use session_handler::{GatewaySessionHandler, GatewaySessionHandlerFactory, ServerInfo};
pub use session_registry::{DeliveryOutcome, RegistryError, SessionHandler, SessionRegistry};
pub use tool_invocation_service::{ToolInvocationError, ToolInvocationService};
