// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Pure data model of the gateway: sessions, operations, approvals,
//! notifications, shared resources, the failure taxonomy and the tool contract.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types and invariants, no I/O

pub mod session;
pub mod operation;
pub mod approval;
pub mod notification;
pub mod resource;
pub mod failure;
pub mod tool;
pub mod protocol;
pub mod collaborators;
pub mod events;
pub mod gateway_config;
