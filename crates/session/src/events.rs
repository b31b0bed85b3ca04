//! Event broadcasting for connection lifecycle observability.
//!
//! Provides [`SessionEvent`] variants emitted by the manager and the closure
//! worker, and an [`EventBus`] backed by `tokio::sync::broadcast`.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::endpoint::EndpointKey;

// ---------------------------------------------------------------------------
// SessionEvent
// ---------------------------------------------------------------------------

/// Events emitted while connections are opened, used, replaced and closed.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new connection was opened and installed in the cache.
    ConnectionOpened {
        /// The endpoint served.
        key: EndpointKey,
        /// The new connection instance.
        connection_id: Uuid,
        /// Endpoint version it was opened for.
        endpoint_version: u64,
        /// Connection version it was opened for.
        connection_version: u64,
    },
    /// A cached connection was superseded by a new one.
    ConnectionReplaced {
        /// The endpoint served.
        key: EndpointKey,
        /// The superseded instance, now scheduled for closure.
        old_connection_id: Uuid,
        /// The instance that replaced it.
        new_connection_id: Uuid,
    },
    /// A concurrent replacement won; the redundant connection was closed.
    RaceLost {
        /// The endpoint served.
        key: EndpointKey,
        /// The redundant connection instance.
        connection_id: Uuid,
    },
    /// A session was handed to a caller.
    SessionDispatched {
        /// The endpoint served.
        key: EndpointKey,
        /// The serving connection instance.
        connection_id: Uuid,
    },
    /// A session was released.
    SessionReleased {
        /// The endpoint served.
        key: EndpointKey,
        /// The serving connection instance.
        connection_id: Uuid,
        /// The connection had already been replaced at release time.
        superseded: bool,
    },
    /// A connection was marked stale and will be replaced on next lookup.
    MarkedStale {
        /// The endpoint served.
        key: EndpointKey,
        /// The stale connection instance.
        connection_id: Uuid,
        /// Why the connection was marked.
        reason: StaleReason,
    },
    /// A connection was closed.
    ConnectionClosed {
        /// The endpoint served.
        key: EndpointKey,
        /// The closed connection instance.
        connection_id: Uuid,
        /// Why the connection was closed.
        reason: CloseReason,
        /// Sessions dispatched but not accounted as released at close time.
        outstanding: u64,
    },
    /// A collaborator call failed.
    Error {
        /// The endpoint served.
        key: EndpointKey,
        /// Human-readable error description.
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Reasons
// ---------------------------------------------------------------------------

/// Why a connection was marked stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Opening a session on it failed or timed out.
    SessionFailure,
    /// A caller released a session with `mark_stale = true`.
    ReleasedBroken,
    /// The configuration store invalidated the endpoint or connection entity.
    Invalidated,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Replaced in the cache; closed after its grace period.
    Superseded,
    /// Opened by a caller that lost a replacement race.
    RaceLost,
    /// The manager shut down.
    Shutdown,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus for connection lifecycle events.
///
/// Emission is fire-and-forget: if no subscribers are listening or the
/// channel is full, events are dropped (no backpressure on the emitter).
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: SessionEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events emitted after this call.
    ///
    /// A subscriber that falls behind by more than the buffer size receives
    /// `Lagged` and skips to the latest events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}
