//! Per-call context with cancellation and deadline support

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Context for a single `get_session` call.
///
/// Carries the caller's cancellation token and an optional timeout that
/// tightens the manager's configured deadlines for connection and session
/// creation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Identifier of the unit of work on whose behalf the call is made.
    pub request_id: String,
    /// Cooperative cancellation token. When cancelled, pending connection or
    /// session creation is abandoned and nothing is installed in the cache.
    pub cancellation: CancellationToken,
    /// Optional caller deadline, applied to each blocking collaborator call.
    pub timeout: Option<Duration>,
    /// Arbitrary key-value pairs carried for logging.
    pub metadata: HashMap<String, String>,
}

impl Context {
    /// Create a new context for the given request.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    /// Set a caller deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Add a key-value metadata pair to the context.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the caller has cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The deadline to apply given the manager's configured bound.
    #[must_use]
    pub fn effective_timeout(&self, configured: Duration) -> Duration {
        self.timeout.map_or(configured, |t| t.min(configured))
    }
}
