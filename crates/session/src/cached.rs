//! Cached connections and the handles that identify them.
//!
//! A [`CachedConnection`] owns exactly one transport connection together with
//! the configuration fingerprint it was opened for. Bookkeeping fields are
//! atomics so the closure worker can read them without taking the manager's
//! map locks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::connection::Connection;
use crate::endpoint::{EndpointConfig, EndpointKey};
use crate::error::BoxError;

const ACTIVE: u8 = 0;
const GRACE_PERIOD: u8 = 1;
const CLOSED: u8 = 2;

/// Closure state of a cached connection: `Active → GracePeriod → Closed`.
///
/// A connection may also go straight from `Active` to `Closed` (lost
/// replacement race, shutdown). There is no transition back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CloseState {
    /// Reachable from the cache or still usable by handle holders.
    Active,
    /// Superseded and waiting for its grace period to elapse.
    GracePeriod,
    /// The underlying connection has been closed.
    Closed,
}

impl CloseState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            ACTIVE => Self::Active,
            GRACE_PERIOD => Self::GracePeriod,
            _ => Self::Closed,
        }
    }
}

/// One live backing connection plus its bookkeeping.
pub struct CachedConnection<C: Connection> {
    id: Uuid,
    key: EndpointKey,
    connection: C,
    endpoint_version: u64,
    connection_version: u64,
    dispatch_count: AtomicU64,
    release_count: AtomicU64,
    stale: AtomicBool,
    state: AtomicU8,
    created_at: DateTime<Utc>,
}

impl<C: Connection> CachedConnection<C> {
    /// Wrap a freshly opened connection built from `endpoint`.
    pub(crate) fn new(endpoint: &EndpointConfig, connection: C) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: endpoint.key(),
            connection,
            endpoint_version: endpoint.endpoint_version,
            connection_version: endpoint.connection_version,
            dispatch_count: AtomicU64::new(0),
            release_count: AtomicU64::new(0),
            stale: AtomicBool::new(false),
            state: AtomicU8::new(ACTIVE),
            created_at: Utc::now(),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub(crate) fn versions(&self) -> (u64, u64) {
        (self.endpoint_version, self.connection_version)
    }

    /// Built from the same configuration version as `endpoint`.
    pub(crate) fn matches(&self, endpoint: &EndpointConfig) -> bool {
        self.versions() == endpoint.versions()
    }

    /// Can serve new sessions for `endpoint` without replacement.
    pub(crate) fn is_usable_for(&self, endpoint: &EndpointConfig) -> bool {
        self.matches(endpoint) && !self.is_stale() && self.state() == CloseState::Active
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Mark stale. Returns `true` only for the call that flipped the flag.
    pub(crate) fn mark_stale(&self) -> bool {
        !self.stale.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn state(&self) -> CloseState {
        CloseState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn dispatched(&self) -> u64 {
        self.dispatch_count.load(Ordering::Acquire)
    }

    pub(crate) fn released(&self) -> u64 {
        self.release_count.load(Ordering::Acquire)
    }

    /// Sessions dispatched but not (yet) accounted as released.
    pub(crate) fn outstanding(&self) -> u64 {
        self.dispatched().saturating_sub(self.released())
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatch_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_release(&self) {
        self.credit_releases(1);
    }

    /// Add `n` releases without ever letting releases exceed dispatches.
    pub(crate) fn credit_releases(&self, n: u64) {
        let _ = self
            .release_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |released| {
                let ceiling = self.dispatch_count.load(Ordering::Acquire);
                Some(released.saturating_add(n).min(ceiling))
            });
    }

    pub(crate) async fn open_session(&self) -> Result<C::Session, BoxError> {
        self.connection.open_session().await
    }

    /// `Active → GracePeriod`. Returns `false` if already scheduled or closed.
    pub(crate) fn begin_grace_period(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, GRACE_PERIOD, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Close the underlying connection once.
    ///
    /// Returns `None` when an earlier call already closed it.
    pub(crate) async fn close(&self) -> Option<Result<(), BoxError>> {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return None;
        }
        Some(self.connection.close().await)
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id,
            key: self.key.clone(),
            endpoint_version: self.endpoint_version,
            connection_version: self.connection_version,
            dispatched: self.dispatched(),
            released: self.released(),
            stale: self.is_stale(),
            state: self.state(),
            created_at: self.created_at,
        }
    }
}

impl<C: Connection> fmt::Debug for CachedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedConnection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("versions", &self.versions())
            .field("dispatched", &self.dispatched())
            .field("released", &self.released())
            .field("stale", &self.is_stale())
            .field("state", &self.state())
            .finish()
    }
}

/// Point-in-time view of one cached connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ConnectionStats {
    /// Unique id of this connection instance.
    pub id: Uuid,
    /// Endpoint the connection serves.
    pub key: EndpointKey,
    /// Endpoint version it was opened for.
    pub endpoint_version: u64,
    /// Connection version it was opened for.
    pub connection_version: u64,
    /// Sessions handed out.
    pub dispatched: u64,
    /// Sessions released while this connection was current.
    pub released: u64,
    /// Whether the connection has been marked stale.
    pub stale: bool,
    /// Closure state.
    pub state: CloseState,
    /// When the connection was opened.
    pub created_at: DateTime<Utc>,
}

/// Opaque handle identifying the connection instance that served a session.
///
/// Handles stay valid after the connection is superseded, which is what lets
/// `release` tell a current connection from a replaced one.
pub struct ConnectionHandle<C: Connection> {
    inner: Arc<CachedConnection<C>>,
}

impl<C: Connection> ConnectionHandle<C> {
    pub(crate) fn new(inner: Arc<CachedConnection<C>>) -> Self {
        Self { inner }
    }

    pub(crate) fn cached(&self) -> &Arc<CachedConnection<C>> {
        &self.inner
    }

    /// Unique id of the connection instance.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    /// Endpoint the connection serves.
    #[must_use]
    pub fn key(&self) -> &EndpointKey {
        self.inner.key()
    }

    /// `(endpoint_version, connection_version)` the connection was opened for.
    #[must_use]
    pub fn versions(&self) -> (u64, u64) {
        self.inner.versions()
    }

    /// Whether the connection has been marked stale.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.inner.is_stale()
    }

    /// Current closure state of the connection.
    #[must_use]
    pub fn state(&self) -> CloseState {
        self.inner.state()
    }

    /// Snapshot of the connection's bookkeeping.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats()
    }
}

impl<C: Connection> Clone for ConnectionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id())
            .field("key", self.inner.key())
            .finish()
    }
}
