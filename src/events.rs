//! Change notifications for external collaborators
//!
//! Events are fire-and-forget. Each subscriber gets its own receiver and
//! unsubscribes by dropping it.

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the broadcast buffer; slow subscribers skip older events
const EVENT_BUFFER: usize = 64;

/// Events published by the selection policy and the tunnel session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// A connect attempt failed before the tunnel was started
    ConnectFailed { reason: String },
    /// The persisted selected server changed
    ServerUpdated { server: String },
}

/// Broadcast bus shared by the services of one client instance
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Register a new observer
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all current observers
    pub fn emit(&self, event: SessionEvent) {
        tracing::debug!("Event: {:?}", event);
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
