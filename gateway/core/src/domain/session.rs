// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Client Session
//!
//! One [`Session`] exists per connected client. Its protocol handler and
//! in-flight request tracking live in the application layer
//! ([`crate::application::session_registry`]); this module only carries the
//! identity and lifecycle data.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──attach/register──▶ Connected ──unregister──▶ Disconnected
//! ```
//!
//! `Disconnected` is terminal. A reconnecting client always receives a new
//! [`SessionId`].

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Connection metadata captured when the client connects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Connection-identifying string (client name, user agent, ...)
    pub client_id: String,
    /// Remote address the connection originated from, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// The session lives for a single request and is closed right after it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,
}

impl ClientMetadata {
    pub fn new(client_id: impl Into<String>, origin: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            origin,
            ephemeral: false,
        }
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }
}

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
}

/// A logical client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub metadata: ClientMetadata,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, metadata: ClientMetadata) -> Self {
        Self {
            id,
            metadata,
            state: SessionState::Connecting,
            created_at: Utc::now(),
        }
    }

    /// Mark the session usable. No-op once disconnected.
    pub fn mark_connected(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let mut session = Session::new(SessionId::new(), ClientMetadata::new("cli", None));
        assert_eq!(session.state, SessionState::Connecting);

        session.mark_connected();
        assert!(session.is_connected());

        session.mark_disconnected();
        assert_eq!(session.state, SessionState::Disconnected);

        // Disconnected is terminal
        session.mark_connected();
        assert_eq!(session.state, SessionState::Disconnected);
    }

    #[test]
    fn test_session_id_parse() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }
}
