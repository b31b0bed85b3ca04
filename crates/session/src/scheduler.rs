//! Deferred closure of superseded connections.
//!
//! Replacing a connection in the cache never closes the old one inline.
//! Instead the old entry is handed to a [`ClosureScheduler`], whose single
//! worker task waits out the grace period and then closes it, so callers that
//! borrowed sessions before the swap can finish their work.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cached::CachedConnection;
use crate::connection::Connection;
use crate::endpoint::EndpointKey;
use crate::events::{CloseReason, EventBus, SessionEvent};

// ---------------------------------------------------------------------------
// PendingReleases
// ---------------------------------------------------------------------------

/// A release that arrived after its connection had been superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRelease {
    /// Endpoint the session was served for.
    pub key: EndpointKey,
    /// Instance that served the session.
    pub connection_id: Uuid,
    /// Endpoint version of that instance.
    pub endpoint_version: u64,
    /// Connection version of that instance.
    pub connection_version: u64,
}

/// Bounded queue of releases waiting to be credited to superseded connections.
///
/// Losing entries is harmless: they only feed the dispatch/release diagnostic
/// logged when a connection is finally closed.
#[derive(Debug)]
pub struct PendingReleases {
    entries: Mutex<VecDeque<PendingRelease>>,
    capacity: usize,
}

impl PendingReleases {
    /// Create a queue that keeps at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Record a release. Drops the oldest entry when the queue is full.
    pub fn push(&self, release: PendingRelease) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(release);
    }

    /// Remove every entry recorded for `connection_id`, returning how many.
    pub fn take_matching(&self, connection_id: Uuid) -> u64 {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|r| r.connection_id != connection_id);
        (before - entries.len()) as u64
    }

    /// Number of unreconciled releases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether there are no unreconciled releases.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Closing
// ---------------------------------------------------------------------------

/// Where a scheduled connection is closed and reported.
///
/// Shared by the closure worker and the manager's inline closes.
pub(crate) struct CloseSink {
    pub(crate) close_timeout: Duration,
    pub(crate) pending: Arc<PendingReleases>,
    pub(crate) events: Arc<EventBus>,
}

/// Reconcile, close and report one connection.
///
/// Close failures and timeouts are logged and never propagated. A connection
/// that was already closed is left alone.
pub(crate) async fn close_connection<C: Connection>(
    conn: &CachedConnection<C>,
    reason: CloseReason,
    sink: &CloseSink,
) {
    let CloseSink {
        close_timeout,
        pending,
        events,
    } = sink;
    conn.credit_releases(pending.take_matching(conn.id()));
    let outstanding = conn.outstanding();
    if outstanding > 0 && reason != CloseReason::RaceLost {
        tracing::warn!(
            endpoint = %conn.key(),
            connection_id = %conn.id(),
            dispatched = conn.dispatched(),
            released = conn.released(),
            ?reason,
            "Closing connection with unreleased sessions"
        );
    }

    let closed = match tokio::time::timeout(*close_timeout, conn.close()).await {
        Ok(None) => return,
        Ok(Some(result)) => result,
        Err(_) => Err(format!(
            "close timed out after {}ms",
            close_timeout.as_millis()
        )
        .into()),
    };
    match closed {
        Ok(()) => {
            tracing::info!(
                endpoint = %conn.key(),
                connection_id = %conn.id(),
                ?reason,
                "Closed connection"
            );
        }
        Err(error) => {
            tracing::warn!(
                endpoint = %conn.key(),
                connection_id = %conn.id(),
                ?reason,
                %error,
                "Error closing connection"
            );
        }
    }

    events.emit(SessionEvent::ConnectionClosed {
        key: conn.key().clone(),
        connection_id: conn.id(),
        reason,
        outstanding,
    });
}

// ---------------------------------------------------------------------------
// ClosureScheduler
// ---------------------------------------------------------------------------

struct Scheduled<C: Connection> {
    conn: Arc<CachedConnection<C>>,
    deadline: Instant,
}

/// Single-consumer queue that closes superseded connections after a grace period.
pub struct ClosureScheduler<C: Connection> {
    sender: mpsc::UnboundedSender<Scheduled<C>>,
    queued: Arc<AtomicUsize>,
    grace_period: Duration,
    sink: Arc<CloseSink>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connection> ClosureScheduler<C> {
    /// Start the closure worker on the current Tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub(crate) fn start(grace_period: Duration, sink: Arc<CloseSink>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            receiver,
            Arc::clone(&queued),
            cancel.clone(),
            Arc::clone(&sink),
        ));

        Self {
            sender,
            queued,
            grace_period,
            sink,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Schedule `conn` for closure after the grace period.
    ///
    /// Returns `false` when the connection was already scheduled or closed;
    /// scheduling the same instance twice never closes it twice.
    pub(crate) fn schedule(&self, conn: Arc<CachedConnection<C>>) -> bool {
        if !conn.begin_grace_period() {
            return false;
        }

        tracing::debug!(
            endpoint = %conn.key(),
            connection_id = %conn.id(),
            grace_ms = self.grace_period.as_millis() as u64,
            "Scheduled connection for closure"
        );

        let item = Scheduled {
            conn,
            deadline: deadline_after(self.grace_period),
        };
        self.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(item)) = self.sender.send(item) {
            // Worker already drained; close without waiting.
            self.queued.fetch_sub(1, Ordering::AcqRel);
            let sink = Arc::clone(&self.sink);
            drop(tokio::spawn(async move {
                close_connection(&item.conn, CloseReason::Shutdown, &sink).await;
            }));
        }
        true
    }

    /// Connections waiting for their grace period to elapse.
    #[must_use]
    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Close everything still queued immediately and stop the worker.
    ///
    /// Idempotent; later calls return once the first drain has finished.
    pub(crate) async fn drain(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && let Err(error) = worker.await
        {
            tracing::error!(%error, "Closure worker terminated abnormally");
        }
    }
}

impl<C: Connection> Drop for ClosureScheduler<C> {
    fn drop(&mut self) {
        // Wake the worker so it drains instead of sleeping out grace periods
        // for a manager nobody can reach anymore.
        self.cancel.cancel();
    }
}

impl<C: Connection> std::fmt::Debug for ClosureScheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureScheduler")
            .field("grace_period", &self.grace_period)
            .field("queued", &self.queued())
            .finish()
    }
}

/// `now + grace`, clamped to a far-future deadline when that overflows.
fn deadline_after(grace: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(grace)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

// Roughly thirty years.
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

async fn run_worker<C: Connection>(
    mut receiver: mpsc::UnboundedReceiver<Scheduled<C>>,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
    sink: Arc<CloseSink>,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            item = receiver.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };

        let reason = tokio::select! {
            biased;
            () = cancel.cancelled() => CloseReason::Shutdown,
            () = tokio::time::sleep_until(item.deadline) => CloseReason::Superseded,
        };
        close_connection(&item.conn, reason, &sink).await;
        queued.fetch_sub(1, Ordering::AcqRel);

        if reason == CloseReason::Shutdown {
            break;
        }
    }

    // Shutdown: no more grace periods.
    receiver.close();
    while let Ok(item) = receiver.try_recv() {
        close_connection(&item.conn, CloseReason::Shutdown, &sink).await;
        queued.fetch_sub(1, Ordering::AcqRel);
    }
    tracing::debug!("Closure worker drained");
}
