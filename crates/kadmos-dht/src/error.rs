//! DHT error types

use thiserror::Error;

/// DHT errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DhtError {
    /// Key has the wrong length
    #[error("key must be {expected} bytes in length, got {actual}")]
    BadKey { expected: usize, actual: usize },

    /// Value exceeds the maximum size
    #[error("value must be less than {max} bytes in length, got {actual}")]
    BadValue { max: usize, actual: usize },

    /// Routing table has no suitable peers for the target
    #[error("no nodes found")]
    NoNodes,

    /// Lookup completed without locating the key
    #[error("value not found")]
    ValueNotFound,

    /// No response arrived before the request deadline
    #[error("request timeout")]
    RequestTimeout,

    /// Socket error
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed wire message
    #[error("bad payload: {0}")]
    BadPayload(String),

    /// Failed to bind a listener socket
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// No bootstrap node responded
    #[error("bootstrapping failed")]
    BootstrapFailed,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl DhtError {
    /// Wrap an IO error as a transport error
    pub(crate) fn transport(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for DHT operations
pub type DhtResult<T> = Result<T, DhtError>;
