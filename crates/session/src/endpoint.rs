//! Endpoint identity and configuration snapshots.

use std::collections::BTreeMap;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Cache key for one logical endpoint.
///
/// Two configurations map to the same key when they name the same endpoint
/// entity and the same connection entity, regardless of their versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EndpointKey {
    endpoint_id: String,
    connection_id: String,
}

impl EndpointKey {
    /// Build a key from the endpoint and connection entity identifiers.
    pub fn new(endpoint_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            connection_id: connection_id.into(),
        }
    }

    /// The endpoint entity identifier.
    #[must_use]
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// The connection entity identifier.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint_id, self.connection_id)
    }
}

/// Read-only snapshot of an endpoint's configuration.
///
/// Owned by the configuration store. Both version counters are bumped by the
/// store whenever the corresponding entity changes; the manager only compares
/// them for equality.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EndpointConfig {
    /// Identifier of the endpoint entity.
    pub endpoint_id: String,
    /// Identifier of the connection entity the endpoint depends on.
    pub connection_id: String,
    /// Version of the endpoint entity.
    pub endpoint_version: u64,
    /// Version of the connection entity.
    pub connection_version: u64,
    /// Transport-specific parameters, opaque to the manager.
    #[cfg_attr(feature = "serde", serde(default))]
    pub properties: BTreeMap<String, String>,
}

impl EndpointConfig {
    /// Create a configuration snapshot with no transport properties.
    pub fn new(
        endpoint_id: impl Into<String>,
        connection_id: impl Into<String>,
        endpoint_version: u64,
        connection_version: u64,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            connection_id: connection_id.into(),
            endpoint_version,
            connection_version,
            properties: BTreeMap::new(),
        }
    }

    /// Add a transport property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Derive the cache key for this configuration.
    #[must_use]
    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(self.endpoint_id.as_str(), self.connection_id.as_str())
    }

    /// The `(endpoint_version, connection_version)` fingerprint.
    #[must_use]
    pub fn versions(&self) -> (u64, u64) {
        (self.endpoint_version, self.connection_version)
    }
}
