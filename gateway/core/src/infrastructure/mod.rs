// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod collaborators;
pub mod event_bus;
pub mod http_tool;
pub mod resilience;
pub mod tool_registry;

pub use collaborators::Collaborators;
pub use event_bus::{EventBus, EventBusError, GatewayEvent};
pub use resilience::ErrorHandler;
pub use tool_registry::ToolRegistry;
