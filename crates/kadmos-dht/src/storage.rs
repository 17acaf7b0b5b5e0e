//! Value storage
//!
//! The DHT core consumes the [`Storage`] trait and ships an in-memory
//! implementation. Persistent backends live outside the core; they only
//! need to honour this contract, including never returning expired
//! values from `get`.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::node::Key;

/// A stored value with its lifetime metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// The 256-bit key the value is stored under
    pub key: Key,
    /// The opaque value bytes
    pub value: Vec<u8>,
    /// Time to live from creation
    pub ttl: Duration,
    /// When the value was created by its original publisher
    pub created: SystemTime,
    /// When the value expires
    pub expires: SystemTime,
}

impl Value {
    /// Create a value; the expiry is computed from creation time and TTL
    pub fn new(key: Key, value: Vec<u8>, created: SystemTime, ttl: Duration) -> Self {
        Self {
            key,
            value,
            ttl,
            created,
            expires: created + ttl,
        }
    }

    /// Whether the value has outlived its TTL
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires
    }
}

/// The storage contract the DHT core consumes
pub trait Storage: Send + Sync + 'static {
    /// All live values stored under `key`. When `from` is set, only
    /// values created at or after it are returned. `None` when nothing
    /// matches.
    fn get(&self, key: &Key, from: Option<SystemTime>) -> Option<Vec<Value>>;

    /// Store a value under `key`. Storing an identical value twice
    /// leaves a single occurrence. Returns false when the value was
    /// rejected.
    fn set(&self, key: &Key, value: &[u8], created: SystemTime, ttl: Duration) -> bool;

    /// Visit every stored value until the visitor returns false
    fn iterate(&self, visit: &mut dyn FnMut(&Value) -> bool);

    /// Lifecycle hook for backends holding external resources
    fn close(&self) {}
}

/// One key's values, deduplicated by value hash
#[derive(Debug, Default)]
struct Item {
    hashes: HashSet<u64>,
    values: Vec<Value>,
}

/// The canonical in-memory backend
pub struct MemoryStorage {
    items: Mutex<HashMap<Key, Item>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every expired value; called periodically by the owning DHT's
    /// sweeper task. Returns the number of values removed.
    pub fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut items = self.items.lock().unwrap();
        let mut removed = 0;

        items.retain(|_, item| {
            let before = item.values.len();
            item.values.retain(|value| {
                let keep = !value.is_expired(now);
                if !keep {
                    item.hashes.remove(&value_hash(&value.value));
                }
                keep
            });
            removed += before - item.values.len();
            !item.values.is_empty()
        });

        if removed > 0 {
            debug!(removed, "purged expired values");
        }

        removed
    }

    /// The number of keys currently held
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &Key, from: Option<SystemTime>) -> Option<Vec<Value>> {
        let now = SystemTime::now();
        let items = self.items.lock().unwrap();
        let item = items.get(key)?;

        let values: Vec<Value> = item
            .values
            .iter()
            .filter(|value| !value.is_expired(now))
            .filter(|value| from.map(|from| value.created >= from).unwrap_or(true))
            .cloned()
            .collect();

        if values.is_empty() {
            return None;
        }

        Some(values)
    }

    fn set(&self, key: &Key, value: &[u8], created: SystemTime, ttl: Duration) -> bool {
        let hash = value_hash(value);

        let mut items = self.items.lock().unwrap();
        let item = items.entry(*key).or_default();

        // identical values collapse to a single occurrence
        if !item.hashes.insert(hash) {
            return true;
        }

        item.values
            .push(Value::new(*key, value.to_vec(), created, ttl));

        true
    }

    fn iterate(&self, visit: &mut dyn FnMut(&Value) -> bool) {
        let items = self.items.lock().unwrap();

        for item in items.values() {
            for value in &item.values {
                if !visit(value) {
                    return;
                }
            }
        }
    }
}

fn value_hash(value: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
