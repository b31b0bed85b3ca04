//! # Conduit Session
//!
//! Pooled connection/session management for request pipelines that talk to
//! a backing messaging system. One long-lived connection is kept current per
//! endpoint; callers borrow short-lived sessions from it. Configuration
//! version changes and broken connections trigger lazy replacement, and
//! replaced connections are closed in the background after a grace period.

pub mod cached;
pub mod config;
pub mod connection;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod lease;
pub mod lifecycle;
pub mod manager;
pub mod scheduler;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use cached::{CloseState, ConnectionHandle, ConnectionStats};
pub use config::ManagerConfig;
pub use connection::{Connection, ConnectionFactory, Session};
pub use context::Context;
pub use endpoint::{EndpointConfig, EndpointKey};
pub use error::{BoxError, Error, Result};
pub use events::{CloseReason, EventBus, SessionEvent, StaleReason};
pub use lease::SessionLease;
pub use lifecycle::{LifecycleState, ShutdownCoordinator};
pub use manager::{HandleOf, ManagerStats, ResourceManager, SessionOf};
pub use scheduler::{PendingRelease, PendingReleases};

#[cfg(feature = "metrics")]
pub use metrics::MetricsCollector;
