//! Node identity and the XOR prefix metric

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{KEY_BITS, KEY_BYTES};

/// A 256-bit key in the DHT address space
pub type Key = [u8; KEY_BYTES];

/// A node's unique 256-bit identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; KEY_BYTES]);

impl NodeId {
    /// The all-zeroes id, used as a placeholder for peers whose
    /// identity is not yet known (e.g. bootstrap addresses)
    pub const ZERO: NodeId = NodeId([0u8; KEY_BYTES]);

    /// Generate a random id from the given source
    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut id = [0u8; KEY_BYTES];
        rng.fill_bytes(&mut id);
        Self(id)
    }

    /// Generate a random id from the operating system's CSPRNG
    pub fn generate() -> Self {
        Self::random(&mut rand::rngs::OsRng)
    }

    /// The raw key bytes
    pub fn as_bytes(&self) -> &Key {
        &self.0
    }
}

impl From<Key> for NodeId {
    fn from(key: Key) -> Self {
        Self(key)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The number of leading bits `a` and `b` share, measured over the full
/// 256-bit keyspace. A larger prefix means the keys are closer together;
/// a key is at distance 256 from itself.
pub fn distance(a: &Key, b: &Key) -> usize {
    let mut prefix = 0;

    for i in 0..KEY_BYTES {
        let d = a[i] ^ b[i];

        if d == 0 {
            prefix += 8;
        } else {
            prefix += d.leading_zeros() as usize;
            break;
        }
    }

    prefix
}

/// The index of the bucket that `id` belongs to, relative to `local`.
/// Closer nodes land in higher-numbered positions of the prefix, so the
/// bucket index shrinks as the shared prefix grows; a node identical to
/// `local` maps to bucket 0.
pub fn bucket_index(local: &Key, id: &Key) -> usize {
    let d = KEY_BITS - distance(local, id);

    if d == 0 {
        return 0;
    }

    d - 1
}

/// A snapshot of a peer handed out to lookups and callers. Holds no
/// reference back into the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    /// The peer's id
    pub id: NodeId,
    /// The peer's UDP address
    pub address: SocketAddrV4,
    /// Last measured round-trip latency, zero when unmeasured
    pub latency: Duration,
}

impl Contact {
    /// Create a contact with no measured latency
    pub fn new(id: NodeId, address: SocketAddrV4) -> Self {
        Self {
            id,
            address,
            latency: Duration::ZERO,
        }
    }
}

/// A peer record owned by its routing table bucket
#[derive(Debug, Clone)]
pub(crate) struct Peer {
    /// The peer's id
    pub id: NodeId,
    /// The peer's UDP address
    pub address: SocketAddrV4,
    /// The last time an event was received from this peer
    pub last_seen: Instant,
    /// The number of requests awaiting a response from this peer
    pub pending: u32,
    /// Last measured round-trip latency
    pub latency: Duration,
    /// Consecutive failed attempts to reach this peer
    pub fail_count: u32,
}

impl Peer {
    pub fn new(id: NodeId, address: SocketAddrV4, latency: Duration) -> Self {
        Self {
            id,
            address,
            last_seen: Instant::now(),
            pending: 0,
            latency,
            fail_count: 0,
        }
    }

    /// Refresh the peer after hearing from it
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.pending = 0;
        self.fail_count = 0;
    }

    pub fn contact(&self) -> Contact {
        Contact {
            id: self.id,
            address: self.address,
            latency: self.latency,
        }
    }
}

/// A seedable source for request ids and refresh targets. Owned
/// explicitly by the components that need cheap random ids rather than
/// reaching for process-global RNG state.
pub(crate) struct IdGen {
    rng: Mutex<StdRng>,
}

impl IdGen {
    /// Seed from the operating system's CSPRNG
    pub fn new() -> Self {
        Self::seeded(rand::rngs::OsRng.next_u64())
    }

    /// Seed deterministically, for tests
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// A fresh 32-byte request id
    pub fn request_id(&self) -> Key {
        let mut id = [0u8; KEY_BYTES];
        self.rng.lock().unwrap().fill_bytes(&mut id);
        id
    }

    /// A random id that falls inside the given bucket's range: the local
    /// id with the bit just past the bucket's shared prefix flipped and
    /// every byte to its right randomized. Bucket `i` holds peers sharing
    /// a `KEY_BITS - 1 - i` bit prefix with the local id.
    pub fn random_id_in_bucket(&self, local: &Key, index: usize) -> NodeId {
        let mut id = *local;

        let flip = KEY_BITS - 1 - index;
        let byte_index = flip / 8;
        let bit_index = flip % 8;
        id[byte_index] ^= 1 << (7 - bit_index);

        let mut rng = self.rng.lock().unwrap();
        for b in id.iter_mut().skip(byte_index + 1) {
            *b = (rng.next_u32() & 0xff) as u8;
        }

        NodeId(id)
    }
}
