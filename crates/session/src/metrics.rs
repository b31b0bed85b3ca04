//! Metrics collection for connection lifecycle events.
//!
//! Subscribes to the [`EventBus`] and translates events into counters via
//! the `metrics` crate.
//!
//! Gated behind the `metrics` feature.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::endpoint::EndpointKey;
use crate::events::{EventBus, SessionEvent};

/// Background metrics collector that subscribes to an [`EventBus`].
///
/// # Usage
///
/// ```rust,ignore
/// let collector = MetricsCollector::new(manager.events());
/// let cancel = CancellationToken::new();
/// tokio::spawn(collector.run(cancel));
/// ```
pub struct MetricsCollector {
    receiver: broadcast::Receiver<SessionEvent>,
}

impl MetricsCollector {
    /// Create a new collector subscribed to the given event bus.
    #[must_use]
    pub fn new(event_bus: &EventBus) -> Self {
        Self {
            receiver: event_bus.subscribe(),
        }
    }

    /// Consume events until the bus is dropped or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                result = self.receiver.recv() => {
                    match result {
                        Ok(event) => Self::record_event(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "MetricsCollector lagged behind event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    fn record_event(event: &SessionEvent) {
        match event {
            SessionEvent::ConnectionOpened { key, .. } => {
                metrics::counter!("session.connection.opened.total", &endpoint_labels(key))
                    .increment(1);
            }
            SessionEvent::ConnectionReplaced { key, .. } => {
                metrics::counter!("session.connection.replaced.total", &endpoint_labels(key))
                    .increment(1);
            }
            SessionEvent::RaceLost { key, .. } => {
                metrics::counter!("session.connection.race_lost.total", &endpoint_labels(key))
                    .increment(1);
            }
            SessionEvent::SessionDispatched { key, .. } => {
                metrics::counter!("session.dispatch.total", &endpoint_labels(key)).increment(1);
            }
            SessionEvent::SessionReleased {
                key, superseded, ..
            } => {
                let mut labels = endpoint_labels(key);
                labels.push(("superseded", superseded.to_string()));
                metrics::counter!("session.release.total", &labels).increment(1);
            }
            SessionEvent::MarkedStale { key, reason, .. } => {
                let mut labels = endpoint_labels(key);
                labels.push(("reason", format!("{reason:?}")));
                metrics::counter!("session.connection.stale.total", &labels).increment(1);
            }
            SessionEvent::ConnectionClosed {
                key,
                reason,
                outstanding,
                ..
            } => {
                let mut labels = endpoint_labels(key);
                labels.push(("reason", format!("{reason:?}")));
                metrics::counter!("session.connection.closed.total", &labels).increment(1);
                if *outstanding > 0 {
                    metrics::counter!(
                        "session.connection.closed_outstanding.total",
                        &endpoint_labels(key)
                    )
                    .increment(*outstanding);
                }
            }
            SessionEvent::Error { key, .. } => {
                metrics::counter!("session.error.total", &endpoint_labels(key)).increment(1);
            }
        }
    }
}

/// Labels identifying an endpoint, one per key component.
fn endpoint_labels(key: &EndpointKey) -> Vec<(&'static str, String)> {
    vec![
        ("endpoint_id", key.endpoint_id().to_owned()),
        ("connection_id", key.connection_id().to_owned()),
    ]
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}
