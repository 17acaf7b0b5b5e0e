//! DHT configuration

use std::sync::Arc;
use std::time::Duration;

use crate::error::{DhtError, DhtResult};
use crate::node::NodeId;
use crate::storage::Storage;

/// Configuration for a DHT node
#[derive(Clone)]
pub struct DhtConfig {
    /// This node's id. A random id is generated when not set
    pub local_id: Option<NodeId>,

    /// The UDP address to listen on, e.g. `"0.0.0.0:9000"`
    pub listen_address: String,

    /// The UDP addresses of the bootstrap nodes
    pub bootstrap_addresses: Vec<String>,

    /// The number of listener sockets sharing the listen port.
    /// Defaults to the available parallelism
    pub listeners: usize,

    /// How long before a pending request times out
    pub timeout: Duration,

    /// Size of each socket's send and receive buffer
    pub socket_buffer_size: usize,

    /// How many datagrams are read or written per batch
    pub socket_batch_size: usize,

    /// How often a partially filled write batch is flushed
    pub socket_batch_interval: Duration,

    /// How long a routing table entry may go unseen before it is
    /// considered stale and eligible for eviction
    pub node_expiry: Duration,

    /// Peers slower than this are excluded from latency-based routing
    pub latency_threshold: Duration,

    /// Seed lookups from the lowest-latency peers instead of the
    /// XOR-closest peers
    pub latency_routing: bool,

    /// Storage backend. An in-memory store is used when not set
    pub storage: Option<Arc<dyn Storage>>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            local_id: None,
            listen_address: "0.0.0.0:0".to_string(),
            bootstrap_addresses: Vec::new(),
            listeners: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            timeout: Duration::from_secs(60),
            socket_buffer_size: 32 * 1024 * 1024,
            socket_batch_size: 1024,
            socket_batch_interval: Duration::from_millis(1),
            node_expiry: Duration::from_secs(3600),
            latency_threshold: Duration::from_millis(500),
            latency_routing: false,
            storage: None,
        }
    }
}

impl DhtConfig {
    /// Create a config listening on the given address
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            ..Default::default()
        }
    }

    /// Add a bootstrap address
    pub fn with_bootstrap(mut self, address: impl Into<String>) -> Self {
        self.bootstrap_addresses.push(address.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> DhtResult<()> {
        if self.listeners == 0 {
            return Err(DhtError::Config("at least one listener is required".into()));
        }
        if self.socket_batch_size == 0 {
            return Err(DhtError::Config("socket batch size must be > 0".into()));
        }
        if self.socket_batch_interval.is_zero() {
            return Err(DhtError::Config(
                "socket batch interval must be > 0".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(DhtError::Config("request timeout must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DhtConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_listeners() {
        let config = DhtConfig {
            listeners: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
