//! Kademlia-style distributed hash table over UDP
//!
//! Peers cooperate to store small TTL'd values under 256-bit keys,
//! replicated to the K closest nodes in an XOR metric space. Lookups
//! are iterative with bounded parallelism; payloads larger than the MTU
//! are fragmented across datagrams and reassembled on arrival.
//!
//! ```no_run
//! use std::time::Duration;
//! use kadmos_dht::{key, Dht, DhtConfig};
//!
//! # async fn example() -> Result<(), kadmos_dht::DhtError> {
//! let dht = Dht::new(DhtConfig::new("0.0.0.0:9000")).await?;
//!
//! dht.store(&key("greeting"), b"hello", Duration::from_secs(3600), |result| {
//!     if let Err(e) = result {
//!         eprintln!("store failed: {e}");
//!     }
//! });
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod dht;
pub mod error;
pub mod journey;
pub mod latency;
mod listener;
pub mod node;
pub mod packet;
pub mod protocol;
pub mod routing;
pub mod storage;

pub use config::DhtConfig;
pub use dht::{key, Dht};
pub use error::{DhtError, DhtResult};
pub use journey::Journey;
pub use node::{distance, Contact, Key, NodeId};
pub use routing::RoutingTable;
pub use storage::{MemoryStorage, Storage, Value};

/// Replication factor and bucket capacity
pub const K: usize = 20;

/// Lookup parallelism
pub const ALPHA: usize = 3;

/// Bits in a key
pub const KEY_BITS: usize = 256;

/// Bytes in a key
pub const KEY_BYTES: usize = KEY_BITS / 8;

/// Maximum size of a stored value
pub const VALUE_BYTES: usize = 32 * 1024;
