// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Session Registry & Transport Multiplexer
//!
//! Admits client connections, gives each one an isolated protocol handler,
//! routes inbound JSON-RPC messages to it and carries outbound messages back.
//!
//! # Delivery modes
//!
//! - [`SessionRegistry::send_response`] is RPC-style: the target must be a
//!   connected session with an attached channel, otherwise the caller gets an
//!   error.
//! - [`SessionRegistry::deliver`] is fire-and-forget: notifications for known
//!   sessions are queued (bounded, oldest dropped), notifications for unknown
//!   or disconnected sessions are dropped. Delivery is at-most-once and is not
//!   carried across reconnects.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Session lifecycle, per-session isolation and message routing

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::events::SessionEvent;
use crate::domain::notification::{Notification, NotificationId};
use crate::domain::protocol::{JsonRpcRequest, JsonRpcResponse, OutboundMessage};
use crate::domain::session::{ClientMetadata, Session, SessionId};
use crate::infrastructure::event_bus::EventBus;

/// Per-session protocol handler. One instance per session, never shared.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Handle one inbound message. Notifications yield `None`.
    async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse>;

    /// Abort every in-flight call. Returns how many were aborted.
    fn cancel_all(&self) -> usize;

    fn in_flight(&self) -> usize;
}

pub trait SessionHandlerFactory: Send + Sync {
    fn create(&self, session_id: SessionId) -> Arc<dyn SessionHandler>;
}

/// Observer of session lifecycle. `unregister` awaits every listener.
#[async_trait]
pub trait SessionLifecycleListener: Send + Sync {
    async fn on_session_closed(&self, session_id: SessionId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {0} has no open channel")]
    NoChannel(SessionId),

    #[error("channel for session {0} is closed")]
    ChannelClosed(SessionId),
}

/// Result of a fire-and-forget delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Pushed down an attached channel.
    Pushed,
    /// Held in the session's queue.
    Queued,
    /// Target unknown or gone.
    Dropped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub sessions_with_channel: usize,
    pub queued_notifications: usize,
    pub in_flight_calls: usize,
}

struct SessionEntry {
    session: Session,
    handler: Arc<dyn SessionHandler>,
    queue: VecDeque<Notification>,
    channel: Option<mpsc::UnboundedSender<OutboundMessage>>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    factory: Arc<dyn SessionHandlerFactory>,
    listeners: RwLock<BTreeMap<ListenerId, Arc<dyn SessionLifecycleListener>>>,
    next_listener: AtomicU64,
    queue_capacity: usize,
    event_bus: EventBus,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn SessionHandlerFactory>, queue_capacity: usize, event_bus: EventBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            listeners: RwLock::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            event_bus,
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Register a new session under a fresh id.
    pub fn connect(&self, metadata: ClientMetadata) -> SessionId {
        let id = SessionId::new();
        self.register(id, metadata);
        id
    }

    /// Register `session_id` with its own handler. Idempotent: returns `false`
    /// and leaves the existing session untouched if the id is already live.
    pub fn register(&self, session_id: SessionId, metadata: ClientMetadata) -> bool {
        let client_id = metadata.client_id.clone();
        {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&session_id) {
                debug!(session_id = %session_id, "Session already registered");
                return false;
            }
            let mut session = Session::new(session_id, metadata);
            session.mark_connected();
            let handler = self.factory.create(session_id);
            sessions.insert(
                session_id,
                SessionEntry {
                    session,
                    handler,
                    queue: VecDeque::new(),
                    channel: None,
                },
            );
            metrics::gauge!("gateway_sessions_active").set(sessions.len() as f64);
        }

        info!(session_id = %session_id, client_id = %client_id, "Session registered");
        self.event_bus.publish_session_event(SessionEvent::SessionConnected {
            session_id,
            client_id,
            connected_at: Utc::now(),
        });
        true
    }

    /// Tear a session down: abort its in-flight calls, discard its queue and
    /// channel, then run every lifecycle listener (pending-operation
    /// cancellation, lock release) before returning.
    pub async fn unregister(&self, session_id: SessionId) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(&session_id);
            metrics::gauge!("gateway_sessions_active").set(sessions.len() as f64);
            removed
        };

        let Some(mut entry) = removed else {
            debug!(session_id = %session_id, "Unregister for unknown session ignored");
            return false;
        };

        entry.session.mark_disconnected();
        let aborted = entry.handler.cancel_all();
        let discarded = entry.queue.len();
        drop(entry);

        info!(
            session_id = %session_id,
            aborted_calls = aborted,
            discarded_notifications = discarded,
            "Session unregistered"
        );

        let listeners: Vec<_> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener.on_session_closed(session_id).await;
        }

        self.event_bus.publish_session_event(SessionEvent::SessionDisconnected {
            session_id,
            disconnected_at: Utc::now(),
        });
        true
    }

    /// Unregister every session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        info!(sessions = ids.len(), "Shutting down session registry");
        for id in ids {
            self.unregister(id).await;
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionLifecycleListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().insert(id, listener);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    // ─── Inbound ────────────────────────────────────────────────────────────

    pub fn handler(&self, session_id: SessionId) -> Result<Arc<dyn SessionHandler>, RegistryError> {
        self.sessions
            .read()
            .get(&session_id)
            .map(|entry| entry.handler.clone())
            .ok_or(RegistryError::SessionNotFound(session_id))
    }

    /// Route one inbound message to the session's handler.
    pub async fn dispatch(
        &self,
        session_id: SessionId,
        request: JsonRpcRequest,
    ) -> Result<Option<JsonRpcResponse>, RegistryError> {
        let handler = self.handler(session_id)?;
        debug!(session_id = %session_id, method = %request.method, "Dispatching message");
        Ok(handler.handle(request).await)
    }

    // ─── Outbound ───────────────────────────────────────────────────────────

    /// Bind a persistent channel to the session and flush its queue into it.
    pub fn attach_channel(
        &self,
        session_id: SessionId,
    ) -> Result<mpsc::UnboundedReceiver<OutboundMessage>, RegistryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::SessionNotFound(session_id))?;

        for notification in &entry.queue {
            let _ = tx.send(OutboundMessage::from(notification));
        }
        entry.queue.retain(|n| n.requires_ack && !n.acknowledged);
        entry.channel = Some(tx);
        debug!(session_id = %session_id, "Channel attached");
        Ok(rx)
    }

    pub fn detach_channel(&self, session_id: SessionId) {
        if let Some(entry) = self.sessions.write().get_mut(&session_id) {
            entry.channel = None;
        }
    }

    /// RPC-style delivery of a response. Fails if the session cannot receive it.
    pub fn send_response(&self, session_id: SessionId, response: JsonRpcResponse) -> Result<(), RegistryError> {
        let sessions = self.sessions.read();
        let entry = sessions
            .get(&session_id)
            .filter(|e| e.session.is_connected())
            .ok_or(RegistryError::SessionNotFound(session_id))?;
        let channel = entry.channel.as_ref().ok_or(RegistryError::NoChannel(session_id))?;
        channel
            .send(OutboundMessage::Response(response))
            .map_err(|_| RegistryError::ChannelClosed(session_id))
    }

    /// Fire-and-forget delivery of a notification to its target session.
    pub fn deliver(&self, notification: Notification) -> DeliveryOutcome {
        let target = notification.target;
        let mut sessions = self.sessions.write();
        let Some(entry) = sessions.get_mut(&target).filter(|e| e.session.is_connected()) else {
            debug!(
                session_id = %target,
                kind = ?notification.kind,
                "Dropping notification for unknown session"
            );
            metrics::counter!("gateway_notifications_dropped_total", "reason" => "unknown_session").increment(1);
            return DeliveryOutcome::Dropped;
        };

        if let Some(channel) = &entry.channel {
            if channel.send(OutboundMessage::from(&notification)).is_ok() {
                if notification.requires_ack {
                    Self::enqueue(entry, notification, self.queue_capacity);
                }
                return DeliveryOutcome::Pushed;
            }
            entry.channel = None;
        }

        Self::enqueue(entry, notification, self.queue_capacity);
        DeliveryOutcome::Queued
    }

    fn enqueue(entry: &mut SessionEntry, notification: Notification, capacity: usize) {
        while entry.queue.len() >= capacity {
            if let Some(dropped) = entry.queue.pop_front() {
                warn!(
                    session_id = %entry.session.id,
                    notification_id = %dropped.id,
                    "Notification queue full, dropping oldest"
                );
                metrics::counter!("gateway_notifications_dropped_total", "reason" => "overflow").increment(1);
            }
        }
        entry.queue.push_back(notification);
    }

    /// Take the session's queued notifications (poll mode). Notifications that
    /// need acknowledgement stay queued until acknowledged.
    pub fn drain_notifications(&self, session_id: SessionId) -> Result<Vec<Notification>, RegistryError> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::SessionNotFound(session_id))?;
        let drained: Vec<Notification> = entry.queue.iter().cloned().collect();
        entry.queue.retain(|n| n.requires_ack && !n.acknowledged);
        Ok(drained)
    }

    /// Acknowledge one notification. Returns whether it was found.
    pub fn acknowledge(&self, session_id: SessionId, notification_id: NotificationId) -> Result<bool, RegistryError> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::SessionNotFound(session_id))?;
        let before = entry.queue.len();
        entry.queue.retain(|n| n.id != notification_id);
        Ok(entry.queue.len() != before)
    }

    pub fn pending_notifications(&self, session_id: SessionId) -> usize {
        self.sessions
            .read()
            .get(&session_id)
            .map(|e| e.queue.len())
            .unwrap_or(0)
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.read().contains_key(&session_id)
    }

    pub fn is_connected(&self, session_id: SessionId) -> bool {
        self.sessions
            .read()
            .get(&session_id)
            .map(|e| e.session.is_connected())
            .unwrap_or(false)
    }

    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.sessions.read().get(&session_id).map(|e| e.session.clone())
    }

    /// Every registered session, oldest first.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().values().map(|e| e.session.clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Ids of every connected session.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .read()
            .values()
            .filter(|e| e.session.is_connected())
            .map(|e| e.session.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read();
        RegistryStats {
            total_sessions: sessions.len(),
            connected_sessions: sessions.values().filter(|e| e.session.is_connected()).count(),
            sessions_with_channel: sessions.values().filter(|e| e.channel.is_some()).count(),
            queued_notifications: sessions.values().map(|e| e.queue.len()).sum(),
            in_flight_calls: sessions.values().map(|e| e.handler.in_flight()).sum(),
        }
    }
}
