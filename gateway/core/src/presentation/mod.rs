// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Presentation
//!
//! # Architecture
//!
//! - **Layer:** Presentation Layer
//! - **Purpose:** HTTP transports and operational endpoints

pub mod api;

pub use api::{app, AppState, ClientOrigin, SESSION_HEADER};
