//! Session manager: one current connection per endpoint, graceful replacement.
//!
//! The cache maps each [`EndpointKey`] to the connection currently serving it.
//! Lookups that find a missing, version-mismatched or stale entry open a new
//! connection *outside* any map lock, then swap it in with a single
//! compare-and-set on the map entry. The superseded entry goes to the
//! [`ClosureScheduler`] and is closed after the grace period.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use crate::cached::{CachedConnection, CloseState, ConnectionHandle, ConnectionStats};
use crate::config::ManagerConfig;
use crate::connection::{Connection, ConnectionFactory, Session};
use crate::context::Context;
use crate::endpoint::{EndpointConfig, EndpointKey};
use crate::error::{Error, Result};
use crate::events::{CloseReason, EventBus, SessionEvent, StaleReason};
use crate::lease::SessionLease;
use crate::lifecycle::{LifecycleState, StateCell};
use crate::scheduler::{
    CloseSink, ClosureScheduler, PendingRelease, PendingReleases, close_connection,
};

/// Session type produced by a factory's connections.
pub type SessionOf<F> = <<F as ConnectionFactory>::Connection as Connection>::Session;

/// Handle type produced by a factory's connections.
pub type HandleOf<F> = ConnectionHandle<<F as ConnectionFactory>::Connection>;

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicU64,
    replaced: AtomicU64,
    races_lost: AtomicU64,
    open_failures: AtomicU64,
    session_failures: AtomicU64,
    dispatched: AtomicU64,
    released: AtomicU64,
}

/// Manager-wide statistics.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    /// Lifecycle state at snapshot time.
    pub state: LifecycleState,
    /// Connections currently reachable from the cache.
    pub entries: Vec<ConnectionStats>,
    /// Connections opened and installed.
    pub opened: u64,
    /// Installs that superseded an existing entry.
    pub replaced: u64,
    /// Connections opened by callers that lost a replacement race.
    pub races_lost: u64,
    /// Failed `ConnectionFactory::open` calls (including timeouts).
    pub open_failures: u64,
    /// Failed `Connection::open_session` calls (including timeouts).
    pub session_failures: u64,
    /// Sessions handed out.
    pub dispatched: u64,
    /// Sessions released.
    pub released: u64,
    /// Releases for superseded connections not yet reconciled.
    pub pending_releases: usize,
    /// Superseded connections waiting for their grace period.
    pub closure_queue: usize,
}

// ---------------------------------------------------------------------------
// ResourceManager
// ---------------------------------------------------------------------------

enum Install<C: Connection> {
    Fresh,
    Replaced(Arc<CachedConnection<C>>),
    Lost(Arc<CachedConnection<C>>),
}

/// Concurrency-safe cache handing out sessions from one current connection
/// per endpoint.
///
/// Construct it with [`ResourceManager::new`] and inject it where sessions
/// are needed; [`ShutdownCoordinator`](crate::ShutdownCoordinator) wraps one
/// process-wide instance for the outermost wiring layer.
pub struct ResourceManager<F: ConnectionFactory> {
    factory: F,
    config: ManagerConfig,
    cache: DashMap<EndpointKey, Arc<CachedConnection<F::Connection>>>,
    scheduler: ClosureScheduler<F::Connection>,
    sink: Arc<CloseSink>,
    state: StateCell,
    counters: Counters,
}

impl<F: ConnectionFactory> ResourceManager<F> {
    /// Create a running manager and start its closure worker.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `config` is invalid.
    pub fn new(factory: F, config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let sink = Arc::new(CloseSink {
            close_timeout: config.close_timeout,
            pending: Arc::new(PendingReleases::new(config.pending_release_capacity)),
            events: Arc::new(EventBus::new(config.event_buffer)),
        });
        let scheduler = ClosureScheduler::start(config.grace_period, Arc::clone(&sink));

        tracing::info!(
            grace_ms = config.grace_period.as_millis() as u64,
            open_timeout_ms = config.open_timeout.as_millis() as u64,
            "Session manager started"
        );

        Ok(Self {
            factory,
            config,
            cache: DashMap::new(),
            scheduler,
            sink,
            state: StateCell::new(LifecycleState::Running),
            counters: Counters::default(),
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.load()
    }

    /// The event bus, e.g. to attach a metrics collector.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.sink.events
    }

    /// Subscribe to connection lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sink.events.subscribe()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state.load() {
            LifecycleState::Running => Ok(()),
            state => Err(Error::NotInitialized { state }),
        }
    }

    /// Get a session for `endpoint`, opening or replacing its connection when
    /// the cached one is missing, built from another configuration version,
    /// or stale.
    ///
    /// A session-open failure marks the serving connection stale and is
    /// returned as is; the next call replaces the connection.
    pub async fn get_session(
        &self,
        endpoint: &EndpointConfig,
        ctx: &Context,
    ) -> Result<(SessionOf<F>, HandleOf<F>)> {
        self.ensure_running()?;
        let key = endpoint.key();
        let mut current = self.current_for(&key, endpoint, ctx).await?;
        if current.state() != CloseState::Active {
            // Superseded while we were resolving it (e.g. while closing a
            // connection that lost the install race). Resolve once more.
            tracing::debug!(
                endpoint = %key,
                connection_id = %current.id(),
                "Resolved connection was superseded, resolving again"
            );
            current = self.current_for(&key, endpoint, ctx).await?;
        }
        self.dispatch(&key, current, ctx).await
    }

    /// Like [`get_session`](Self::get_session), wrapped in a lease that
    /// releases itself when dropped.
    pub async fn lease(
        self: &Arc<Self>,
        endpoint: &EndpointConfig,
        ctx: &Context,
    ) -> Result<SessionLease<F>> {
        let (session, handle) = self.get_session(endpoint, ctx).await?;
        Ok(SessionLease::new(Arc::clone(self), session, handle))
    }

    async fn current_for(
        &self,
        key: &EndpointKey,
        endpoint: &EndpointConfig,
        ctx: &Context,
    ) -> Result<Arc<CachedConnection<F::Connection>>> {
        // Clone the Arc so the shard lock is not held across the open below.
        let observed = self.cache.get(key).map(|entry| Arc::clone(entry.value()));
        if let Some(current) = observed.as_ref()
            && current.is_usable_for(endpoint)
        {
            return Ok(Arc::clone(current));
        }

        if let Some(previous) = observed.as_ref() {
            tracing::debug!(
                endpoint = %key,
                connection_id = %previous.id(),
                cached_versions = ?previous.versions(),
                wanted_versions = ?endpoint.versions(),
                stale = previous.is_stale(),
                "Cached connection needs replacement"
            );
        }

        self.replace(key, endpoint, ctx).await
    }

    async fn replace(
        &self,
        key: &EndpointKey,
        endpoint: &EndpointConfig,
        ctx: &Context,
    ) -> Result<Arc<CachedConnection<F::Connection>>> {
        let timeout = ctx.effective_timeout(self.config.open_timeout);
        let opened = bounded(key, "open_connection", timeout, ctx, self.factory.open(endpoint))
            .await
            .inspect_err(|_| {
                self.counters.open_failures.fetch_add(1, Ordering::Relaxed);
            })?;

        let connection = match opened {
            Ok(connection) => connection,
            Err(source) => {
                self.counters.open_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(endpoint = %key, error = %source, "Failed to open connection");
                self.sink.events.emit(SessionEvent::Error {
                    key: key.clone(),
                    error: source.to_string(),
                });
                return Err(Error::ConnectionUnavailable {
                    endpoint: key.clone(),
                    source,
                });
            }
        };

        let fresh = Arc::new(CachedConnection::new(endpoint, connection));
        let outcome = match self.cache.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&fresh));
                Install::Fresh
            }
            Entry::Occupied(occupied) if occupied.get().is_usable_for(endpoint) => {
                Install::Lost(Arc::clone(occupied.get()))
            }
            Entry::Occupied(mut occupied) => Install::Replaced(occupied.insert(Arc::clone(&fresh))),
        };

        match outcome {
            Install::Lost(winner) => {
                self.counters.races_lost.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    endpoint = %key,
                    connection_id = %fresh.id(),
                    winner_id = %winner.id(),
                    "Lost replacement race, closing redundant connection"
                );
                self.sink.events.emit(SessionEvent::RaceLost {
                    key: key.clone(),
                    connection_id: fresh.id(),
                });
                close_connection(&fresh, CloseReason::RaceLost, &self.sink).await;
                return Ok(winner);
            }
            Install::Replaced(old) => {
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    endpoint = %key,
                    old_connection_id = %old.id(),
                    new_connection_id = %fresh.id(),
                    versions = ?fresh.versions(),
                    "Replaced cached connection"
                );
                self.sink.events.emit(SessionEvent::ConnectionReplaced {
                    key: key.clone(),
                    old_connection_id: old.id(),
                    new_connection_id: fresh.id(),
                });
                self.scheduler.schedule(old);
            }
            Install::Fresh => {}
        }

        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            endpoint = %key,
            connection_id = %fresh.id(),
            versions = ?fresh.versions(),
            "Opened connection"
        );
        self.sink.events.emit(SessionEvent::ConnectionOpened {
            key: key.clone(),
            connection_id: fresh.id(),
            endpoint_version: endpoint.endpoint_version,
            connection_version: endpoint.connection_version,
        });

        // Shutdown may have drained the cache while we were opening.
        if let Err(err) = self.ensure_running() {
            self.cache.remove_if(key, |_, cached| Arc::ptr_eq(cached, &fresh));
            close_connection(&fresh, CloseReason::Shutdown, &self.sink).await;
            return Err(err);
        }

        Ok(fresh)
    }

    async fn dispatch(
        &self,
        key: &EndpointKey,
        cached: Arc<CachedConnection<F::Connection>>,
        ctx: &Context,
    ) -> Result<(SessionOf<F>, HandleOf<F>)> {
        if cached.is_stale() {
            return Err(Error::session_unavailable(key, "connection marked stale", None));
        }
        match cached.state() {
            CloseState::Active => {}
            CloseState::GracePeriod => {
                return Err(Error::session_unavailable(key, "connection superseded", None));
            }
            CloseState::Closed => {
                return Err(Error::session_unavailable(key, "connection closed", None));
            }
        }

        let timeout = ctx.effective_timeout(self.config.session_timeout);
        match bounded(key, "open_session", timeout, ctx, cached.open_session()).await {
            Ok(Ok(session)) => {
                cached.record_dispatch();
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    endpoint = %key,
                    connection_id = %cached.id(),
                    request_id = %ctx.request_id,
                    "Dispatched session"
                );
                self.sink.events.emit(SessionEvent::SessionDispatched {
                    key: key.clone(),
                    connection_id: cached.id(),
                });
                Ok((session, ConnectionHandle::new(cached)))
            }
            Ok(Err(source)) => {
                self.counters.session_failures.fetch_add(1, Ordering::Relaxed);
                self.sink.events.emit(SessionEvent::Error {
                    key: key.clone(),
                    error: source.to_string(),
                });
                self.mark_stale(&cached, StaleReason::SessionFailure);
                Err(Error::session_unavailable(
                    key,
                    "failed to open session",
                    Some(source),
                ))
            }
            Err(err @ Error::Timeout { .. }) => {
                self.counters.session_failures.fetch_add(1, Ordering::Relaxed);
                self.mark_stale(&cached, StaleReason::SessionFailure);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Release a session obtained from [`get_session`](Self::get_session).
    ///
    /// Always closes the session. When `mark_stale` is set the serving
    /// connection is marked stale whether or not it is still current.
    ///
    /// # Errors
    /// Returns [`Error::NotInitialized`] after shutdown (the session is still
    /// closed first). Session close failures are only logged.
    pub async fn release(
        &self,
        handle: HandleOf<F>,
        mut session: SessionOf<F>,
        mark_stale: bool,
    ) -> Result<()> {
        let cached = handle.cached();
        if let Err(error) = session.close().await {
            tracing::warn!(
                endpoint = %cached.key(),
                connection_id = %cached.id(),
                %error,
                "Error closing session"
            );
        }
        self.ensure_running()?;

        let key = cached.key();
        let is_current = self
            .cache
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), cached));

        if is_current {
            cached.record_release();
        } else {
            let (endpoint_version, connection_version) = cached.versions();
            self.sink.pending.push(PendingRelease {
                key: key.clone(),
                connection_id: cached.id(),
                endpoint_version,
                connection_version,
            });
        }
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            endpoint = %key,
            connection_id = %cached.id(),
            superseded = !is_current,
            mark_stale,
            "Released session"
        );
        self.sink.events.emit(SessionEvent::SessionReleased {
            key: key.clone(),
            connection_id: cached.id(),
            superseded: !is_current,
        });

        if mark_stale {
            self.mark_stale(cached, StaleReason::ReleasedBroken);
        }
        Ok(())
    }

    fn mark_stale(&self, cached: &CachedConnection<F::Connection>, reason: StaleReason) {
        if cached.mark_stale() {
            tracing::warn!(
                endpoint = %cached.key(),
                connection_id = %cached.id(),
                ?reason,
                "Marked connection stale"
            );
            self.sink.events.emit(SessionEvent::MarkedStale {
                key: cached.key().clone(),
                connection_id: cached.id(),
                reason,
            });
        }
    }

    /// Mark the connection cached for `key` stale so the next lookup
    /// replaces it. Returns how many entries were newly marked (0 or 1).
    pub fn invalidate(&self, key: &EndpointKey) -> Result<usize> {
        self.invalidate_where(|k| k == key)
    }

    /// Invalidate every entry for the given endpoint entity.
    pub fn invalidate_endpoint(&self, endpoint_id: &str) -> Result<usize> {
        self.invalidate_where(|k| k.endpoint_id() == endpoint_id)
    }

    /// Invalidate every entry built on the given connection entity.
    pub fn invalidate_connection(&self, connection_id: &str) -> Result<usize> {
        self.invalidate_where(|k| k.connection_id() == connection_id)
    }

    fn invalidate_where(&self, matches: impl Fn(&EndpointKey) -> bool) -> Result<usize> {
        self.ensure_running()?;
        let targets: Vec<_> = self
            .cache
            .iter()
            .filter(|entry| matches(entry.key()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut marked = 0;
        for cached in targets {
            if !cached.is_stale() {
                self.mark_stale(&cached, StaleReason::Invalidated);
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// Snapshot of the cache and manager counters.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let mut entries: Vec<_> = self.cache.iter().map(|entry| entry.value().stats()).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        ManagerStats {
            state: self.state.load(),
            entries,
            opened: self.counters.opened.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            races_lost: self.counters.races_lost.load(Ordering::Relaxed),
            open_failures: self.counters.open_failures.load(Ordering::Relaxed),
            session_failures: self.counters.session_failures.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            pending_releases: self.sink.pending.len(),
            closure_queue: self.scheduler.queued(),
        }
    }

    /// Shut down: close queued connections without waiting for their grace
    /// period, then force-close every cached connection.
    ///
    /// A no-op unless the manager is running.
    pub async fn shutdown(&self) {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::ShuttingDown)
        {
            return;
        }
        tracing::info!(cached = self.cache.len(), "Session manager shutting down");

        self.scheduler.drain().await;

        let entries: Vec<_> = self.cache.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.cache.clear();
        for cached in entries {
            close_connection(&cached, CloseReason::Shutdown, &self.sink).await;
        }

        self.state.store(LifecycleState::Stopped);
        tracing::info!("Session manager stopped");
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ResourceManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("state", &self.state.load())
            .field("cached", &self.cache.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Run `fut` under the caller's cancellation token and a deadline.
async fn bounded<T>(
    key: &EndpointKey,
    operation: &'static str,
    timeout: Duration,
    ctx: &Context,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = ctx.cancellation.cancelled() => Err(Error::Cancelled {
            endpoint: key.clone(),
            operation,
        }),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| {
            let timeout_ms = timeout.as_millis() as u64;
            tracing::warn!(endpoint = %key, operation, timeout_ms, "Operation timed out");
            Error::Timeout {
                endpoint: key.clone(),
                operation,
                timeout_ms,
            }
        }),
    }
}
