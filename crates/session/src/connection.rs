//! Transport collaborator traits.
//!
//! The manager never speaks a wire protocol itself. A transport adapter
//! implements these three traits: the factory opens physical connections,
//! a connection hands out short-lived sessions, and both can be closed.

use std::future::Future;

use crate::endpoint::EndpointConfig;
use crate::error::BoxError;

/// Opens physical connections for an endpoint configuration.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type produced by this factory.
    type Connection: Connection;

    /// Open a new connection for `endpoint`.
    ///
    /// Called without any manager lock held. May block on network I/O and
    /// authentication; the manager bounds it with a timeout.
    fn open(
        &self,
        endpoint: &EndpointConfig,
    ) -> impl Future<Output = Result<Self::Connection, BoxError>> + Send;
}

/// A long-lived, expensive-to-create connection.
pub trait Connection: Send + Sync + 'static {
    /// The unit of work handed out to callers.
    type Session: Session;

    /// Create a new session on this connection.
    fn open_session(&self) -> impl Future<Output = Result<Self::Session, BoxError>> + Send;

    /// Close the physical connection.
    ///
    /// The manager calls this at most once per connection.
    fn close(&self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

/// A short-lived unit of work borrowed from a [`Connection`].
pub trait Session: Send + 'static {
    /// Close the session. Invoked once, from `release`.
    fn close(&mut self) -> impl Future<Output = Result<(), BoxError>> + Send;
}
