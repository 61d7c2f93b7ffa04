//! Event bus for session and state notifications.
//!
//! Components publish what happened (a session came up, the servo changed
//! state, a reconcile failed) and any number of subscribers observe it.
//! Publishing never blocks; slow subscribers lose the oldest events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::ActuatorState;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the session manager, reconciler and queue listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServoEvent {
    /// A characteristic-resolved session is ready.
    SessionEstablished {
        session_id: u64,
        peripheral: String,
        timestamp: i64,
    },
    /// A session was torn down.
    SessionClosed {
        session_id: u64,
        reason: String,
        timestamp: i64,
    },
    /// A desired state was taken from the request queue.
    RequestReceived {
        desired: ActuatorState,
        timestamp: i64,
    },
    /// The stored state already matched the desired state.
    ReconcileSkipped {
        state: ActuatorState,
        timestamp: i64,
    },
    /// The device confirmed a new state.
    StateChanged {
        previous: Option<ActuatorState>,
        observed: ActuatorState,
        timestamp: i64,
    },
    /// Reconciliation failed with the given error kind.
    ReconcileFailed {
        desired: ActuatorState,
        error: String,
        timestamp: i64,
    },
    /// The observed state could not be written to the store.
    RecordFailed {
        state: ActuatorState,
        error: String,
        timestamp: i64,
    },
}

impl ServoEvent {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SessionEstablished { .. } => "session_established",
            Self::SessionClosed { .. } => "session_closed",
            Self::RequestReceived { .. } => "request_received",
            Self::ReconcileSkipped { .. } => "reconcile_skipped",
            Self::StateChanged { .. } => "state_changed",
            Self::ReconcileFailed { .. } => "reconcile_failed",
            Self::RecordFailed { .. } => "record_failed",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::SessionEstablished { timestamp, .. }
            | Self::SessionClosed { timestamp, .. }
            | Self::RequestReceived { timestamp, .. }
            | Self::ReconcileSkipped { timestamp, .. }
            | Self::StateChanged { timestamp, .. }
            | Self::ReconcileFailed { timestamp, .. }
            | Self::RecordFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// Broadcast event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServoEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: ServoEvent) -> bool {
        tracing::trace!(event = event.type_name(), "Publishing event");
        self.tx.send(event).is_ok()
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<ServoEvent>,
}

impl EventBusReceiver {
    /// Receive the next event, skipping over any that were dropped for lag.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ServoEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<ServoEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
