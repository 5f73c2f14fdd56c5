// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! MCP Gateway Core
//!
//! Multi-client session registry, cross-session coordinator and resilience
//! layer for the DevOps MCP gateway.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Wires the domain model, application services, infrastructure
//!   adapters and the HTTP presentation layer together

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
