//! Error types for session management
use thiserror::Error;

use crate::endpoint::EndpointKey;
use crate::lifecycle::LifecycleState;

/// Boxed error returned by the transport collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for every operation exposed by the session manager
#[derive(Error, Debug)]
pub enum Error {
    /// The connection factory could not open a connection for the endpoint
    #[error("Connection unavailable for endpoint '{endpoint}'")]
    ConnectionUnavailable {
        /// The endpoint the connection was requested for
        endpoint: EndpointKey,
        /// The factory error
        #[source]
        source: BoxError,
    },

    /// A cached connection exists but could not produce a session
    #[error("Session unavailable for endpoint '{endpoint}': {reason}")]
    SessionUnavailable {
        /// The endpoint the session was requested for
        endpoint: EndpointKey,
        /// Short description of why no session was produced
        reason: String,
        /// The transport error, if any
        #[source]
        source: Option<BoxError>,
    },

    /// A collaborator call exceeded its deadline
    #[error("Operation '{operation}' timed out after {timeout_ms}ms for endpoint '{endpoint}'")]
    Timeout {
        /// The endpoint being served
        endpoint: EndpointKey,
        /// The operation that timed out
        operation: &'static str,
        /// The deadline that was applied, in milliseconds
        timeout_ms: u64,
    },

    /// The caller cancelled the request through its context
    #[error("Operation '{operation}' cancelled for endpoint '{endpoint}'")]
    Cancelled {
        /// The endpoint being served
        endpoint: EndpointKey,
        /// The operation that was interrupted
        operation: &'static str,
    },

    /// `create_instance` was called after the manager was already created
    #[error("Session manager already initialized")]
    AlreadyInitialized,

    /// The manager is not running (never created, or already shut down)
    #[error("Session manager not initialized (state: {state})")]
    NotInitialized {
        /// The lifecycle state observed by the call
        state: LifecycleState,
    },

    /// Manager configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn session_unavailable(
        endpoint: &EndpointKey,
        reason: impl Into<String>,
        source: Option<BoxError>,
    ) -> Self {
        Self::SessionUnavailable {
            endpoint: endpoint.clone(),
            reason: reason.into(),
            source,
        }
    }

    /// Check if the caller may retry the operation with a fresh `get_session`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. }
                | Self::SessionUnavailable { .. }
                | Self::Timeout { .. }
        )
    }

    /// Whether this error reports misuse of the manager lifecycle.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::AlreadyInitialized | Self::NotInitialized { .. })
    }

    /// Get the endpoint associated with this error (if any)
    #[must_use]
    pub fn endpoint(&self) -> Option<&EndpointKey> {
        match self {
            Self::ConnectionUnavailable { endpoint, .. }
            | Self::SessionUnavailable { endpoint, .. }
            | Self::Timeout { endpoint, .. }
            | Self::Cancelled { endpoint, .. } => Some(endpoint),
            Self::AlreadyInitialized | Self::NotInitialized { .. } | Self::Configuration { .. } => {
                None
            }
        }
    }
}
