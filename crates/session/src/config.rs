//! Manager configuration

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a [`ResourceManager`](crate::ResourceManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    /// How long a superseded connection stays open before it is closed
    pub grace_period: Duration,
    /// Upper bound for opening a new connection
    pub open_timeout: Duration,
    /// Upper bound for opening a session on an existing connection
    pub session_timeout: Duration,
    /// Upper bound for closing a connection; a close that overruns is abandoned
    pub close_timeout: Duration,
    /// Maximum number of unreconciled releases kept for superseded connections
    pub pending_release_capacity: usize,
    /// Buffer size of the lifecycle event bus
    pub event_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(3),
            open_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            pending_release_capacity: 1024,
            event_buffer: 1024,
        }
    }
}

impl ManagerConfig {
    /// Validate the configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.open_timeout.is_zero() {
            return Err(Error::configuration(
                "open_timeout must be greater than zero",
            ));
        }
        if self.session_timeout.is_zero() {
            return Err(Error::configuration(
                "session_timeout must be greater than zero",
            ));
        }
        if self.close_timeout.is_zero() {
            return Err(Error::configuration(
                "close_timeout must be greater than zero",
            ));
        }
        if self.event_buffer == 0 {
            return Err(Error::configuration(
                "event_buffer must be greater than zero",
            ));
        }
        Ok(())
    }
}
