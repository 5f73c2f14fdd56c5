// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Gateway Events
//
// In-memory event streaming using tokio broadcast channels. Feeds the
// operator-facing /events SSE stream and any in-process observers. Events
// are not persisted; a lagging subscriber loses the oldest ones.

use crate::domain::events::{OperationEvent, ResilienceEvent, ResourceEvent, SessionEvent};
use crate::domain::operation::OperationId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    Session(SessionEvent),
    Operation(OperationEvent),
    Resource(ResourceEvent),
    Resilience(ResilienceEvent),
}

/// Event bus for publishing and subscribing to gateway events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<GatewayEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_session_event(&self, event: SessionEvent) {
        self.publish(GatewayEvent::Session(event));
    }

    pub fn publish_operation_event(&self, event: OperationEvent) {
        self.publish(GatewayEvent::Operation(event));
    }

    pub fn publish_resource_event(&self, event: ResourceEvent) {
        self.publish(GatewayEvent::Resource(event));
    }

    pub fn publish_resilience_event(&self, event: ResilienceEvent) {
        self.publish(GatewayEvent::Resilience(event));
    }

    fn publish(&self, event: GatewayEvent) {
        debug!(?event, "Publishing event");

        // send() only fails when nobody is subscribed
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all gateway events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for a single operation
    pub fn subscribe_operation(&self, operation_id: OperationId) -> OperationEventReceiver {
        OperationEventReceiver {
            receiver: self.sender.subscribe(),
            operation_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all gateway events
pub struct EventReceiver {
    receiver: broadcast::Receiver<GatewayEvent>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<GatewayEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&mut self) -> Result<GatewayEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for one operation's events (filtered)
pub struct OperationEventReceiver {
    receiver: broadcast::Receiver<GatewayEvent>,
    operation_id: OperationId,
}

impl OperationEventReceiver {
    pub async fn recv(&mut self) -> Result<OperationEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let GatewayEvent::Operation(op_event) = event {
                if operation_of(&op_event) == self.operation_id {
                    return Ok(op_event);
                }
            }
        }
    }
}

fn operation_of(event: &OperationEvent) -> OperationId {
    match event {
        OperationEvent::OperationInitiated { operation_id, .. }
        | OperationEvent::ApprovalRequested { operation_id, .. }
        | OperationEvent::ApprovalResponded { operation_id, .. }
        | OperationEvent::ApprovalExpired { operation_id, .. }
        | OperationEvent::OperationStarted { operation_id, .. }
        | OperationEvent::OperationCompleted { operation_id, .. }
        | OperationEvent::OperationFailed { operation_id, .. }
        | OperationEvent::OperationCancelled { operation_id, .. } => *operation_id,
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
