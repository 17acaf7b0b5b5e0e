//! Kademlia routing table
//!
//! 256 buckets keyed by shared XOR-prefix length, each holding up to K
//! live peers in least-recently-seen order plus a bounded promotion
//! cache of candidates waiting for a slot.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::node::{bucket_index, distance, Contact, Key, NodeId, Peer};
use crate::{K, KEY_BITS};

/// A single K-bucket: up to K peers ordered oldest first, plus the
/// promotion cache of candidates that arrived while the bucket was full
#[derive(Debug, Default)]
pub(crate) struct Bucket {
    nodes: VecDeque<Peer>,
    cache: VecDeque<Peer>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            nodes: VecDeque::with_capacity(K),
            cache: VecDeque::with_capacity(K),
        }
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    /// Insert or refresh a peer. When the bucket is full, the stalest
    /// evictable member (unseen past `expiry` with more than one
    /// unanswered request) makes room; otherwise the candidate is
    /// stashed in the promotion cache.
    fn insert(&mut self, id: NodeId, address: SocketAddrV4, latency: Duration, expiry: Duration) {
        // an existing peer moves to the tail with its fields refreshed
        if let Some(pos) = self.nodes.iter().position(|n| n.id == id) {
            let mut peer = self.nodes.remove(pos).unwrap();
            peer.touch();
            peer.address = address;
            if !latency.is_zero() {
                peer.latency = latency;
            }
            self.nodes.push_back(peer);
            return;
        }

        let peer = Peer::new(id, address, latency);

        if !self.is_full() {
            self.nodes.push_back(peer);
            return;
        }

        // evict the stalest member: past expiry, multiple unanswered
        // requests, most unanswered requests first
        let now = Instant::now();
        let mut stale: Option<usize> = None;

        for (i, existing) in self.nodes.iter().enumerate() {
            if now < existing.last_seen + expiry || existing.pending <= 1 {
                continue;
            }

            match stale {
                Some(s) if self.nodes[s].pending >= existing.pending => {}
                _ => stale = Some(i),
            }
        }

        if let Some(pos) = stale {
            let evicted = self.nodes.remove(pos).unwrap();
            trace!(evicted = %evicted.id, inserted = %id, "evicted stale peer");
            self.nodes.push_back(peer);
            return;
        }

        self.stash(peer);
    }

    /// Stash a candidate in the promotion cache, evicting the oldest
    /// entry when the cache is at capacity
    fn stash(&mut self, peer: Peer) {
        if let Some(existing) = self.cache.iter_mut().find(|n| n.id == peer.id) {
            existing.last_seen = Instant::now();
            return;
        }

        if self.cache.len() >= K {
            self.cache.pop_front();
        }

        self.cache.push_back(peer);
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut Peer> {
        if let Some(peer) = self.nodes.iter_mut().find(|n| n.id == *id) {
            return Some(peer);
        }
        self.cache.iter_mut().find(|n| n.id == *id)
    }

    /// Remove a peer and promote the oldest cached candidate into the
    /// freed slot
    fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        let pos = self.nodes.iter().position(|n| n.id == *id)?;
        let removed = self.nodes.remove(pos);

        if let Some(mut promoted) = self.cache.pop_front() {
            promoted.touch();
            self.nodes.push_back(promoted);
        }

        removed
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn contacts(&self) -> Vec<Contact> {
        self.nodes.iter().map(Peer::contact).collect()
    }

    fn stale(&self, now: Instant, window: Duration) -> impl Iterator<Item = Contact> + '_ {
        self.nodes
            .iter()
            .filter(move |peer| now.duration_since(peer.last_seen) > window)
            .map(Peer::contact)
    }
}

/// The routing table: one bucket per possible prefix length, each
/// behind its own lock
pub struct RoutingTable {
    local: Contact,
    expiry: Duration,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    /// Create a routing table for the given local node
    pub fn new(local: Contact, expiry: Duration) -> Self {
        let buckets = (0..KEY_BITS).map(|_| Mutex::new(Bucket::new())).collect();

        Self {
            local,
            expiry,
            buckets,
        }
    }

    /// The local node this table is centered on
    pub fn local(&self) -> Contact {
        self.local
    }

    fn bucket_for(&self, id: &NodeId) -> &Mutex<Bucket> {
        &self.buckets[bucket_index(self.local.id.as_bytes(), id.as_bytes())]
    }

    /// Insert or refresh a peer in its bucket
    pub fn insert(&self, id: NodeId, address: SocketAddrV4, latency: Duration) {
        self.bucket_for(&id)
            .lock()
            .unwrap()
            .insert(id, address, latency, self.expiry);
    }

    /// Refresh a peer's last-seen time. Returns false when the peer is
    /// unknown and needs to be inserted
    pub fn seen(&self, id: &NodeId) -> bool {
        let mut bucket = self.bucket_for(id).lock().unwrap();

        match bucket.get_mut(id) {
            Some(peer) => {
                peer.touch();
                true
            }
            None => false,
        }
    }

    /// Remove a peer from its bucket
    pub fn remove(&self, id: &NodeId) {
        if self.bucket_for(id).lock().unwrap().remove(id).is_some() {
            debug!(peer = %id, "removed peer from routing table");
        }
    }

    /// Record an unanswered request sent to a peer
    pub fn touch_pending(&self, id: &NodeId) {
        if let Some(peer) = self.bucket_for(id).lock().unwrap().get_mut(id) {
            peer.pending = peer.pending.saturating_add(1);
        }
    }

    /// Record a failed attempt to reach a peer
    pub fn record_failure(&self, id: &NodeId) {
        if let Some(peer) = self.bucket_for(id).lock().unwrap().get_mut(id) {
            peer.fail_count = peer.fail_count.saturating_add(1);
        }
    }

    /// Record a measured round-trip latency for a peer
    pub fn update_latency(&self, id: &NodeId, latency: Duration) {
        if let Some(peer) = self.bucket_for(id).lock().unwrap().get_mut(id) {
            peer.latency = latency;
        }
    }

    /// The `count` known peers closest to `key`, sorted closest first.
    /// The scan starts at the target's bucket and alternates outward
    /// until enough peers have been gathered or every bucket has been
    /// visited.
    pub fn closest_n(&self, key: &Key, count: usize) -> Vec<Contact> {
        let origin = bucket_index(self.local.id.as_bytes(), key) as isize;

        let mut contacts = Vec::with_capacity(count);
        let mut offset = origin;
        let mut step = 0isize;
        let mut scanned = 0usize;

        loop {
            if offset >= 0 && offset < KEY_BITS as isize {
                contacts.extend(self.buckets[offset as usize].lock().unwrap().contacts());

                if contacts.len() >= count {
                    break;
                }

                scanned += 1;
            }

            if scanned >= KEY_BITS {
                break;
            }

            if step % 2 == 0 {
                offset += step + 1;
            } else {
                offset -= step + 1;
            }

            step += 1;
        }

        contacts.sort_by(|a, b| {
            distance(b.id.as_bytes(), key).cmp(&distance(a.id.as_bytes(), key))
        });

        contacts.truncate(count);
        contacts
    }

    /// The total number of peers across all buckets
    pub fn neighbours(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().unwrap().len())
            .sum()
    }

    /// Snapshot every peer that has gone unseen for longer than `window`
    pub fn stale_contacts(&self, window: Duration) -> Vec<Contact> {
        let now = Instant::now();

        self.buckets
            .iter()
            .flat_map(|bucket| bucket.lock().unwrap().stale(now, window).collect::<Vec<_>>())
            .collect()
    }

    /// Snapshot the peers in a single bucket
    pub fn bucket_contacts(&self, index: usize) -> Vec<Contact> {
        self.buckets[index].lock().unwrap().contacts()
    }

    /// The number of peers in a single bucket
    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets[index].lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::IdGen;

    fn test_addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    fn test_table() -> RoutingTable {
        let local = Contact::new(NodeId::generate(), test_addr(9000));
        RoutingTable::new(local, Duration::from_secs(60))
    }

    #[test]
    fn test_insert_and_seen() {
        let table = test_table();
        let id = NodeId::generate();

        assert!(!table.seen(&id));

        table.insert(id, test_addr(9001), Duration::ZERO);
        assert!(table.seen(&id));

        table.remove(&id);
        assert!(!table.seen(&id));
    }

    #[test]
    fn test_bucket_capacity() {
        let table = test_table();

        for i in 0..100 {
            table.insert(NodeId::generate(), test_addr(9001 + i), Duration::ZERO);
        }

        for i in 0..KEY_BITS {
            assert!(table.bucket_len(i) <= K);
        }
    }

    #[test]
    fn test_closest_n_finds_inserted_node() {
        let table = test_table();

        let mut inserted = Vec::new();
        for i in 0..50 {
            let id = NodeId::generate();
            inserted.push(id);
            table.insert(id, test_addr(9001 + i), Duration::ZERO);
        }

        for id in &inserted {
            let closest = table.closest_n(id.as_bytes(), 1);
            assert_eq!(closest.len(), 1);
            assert_eq!(closest[0].id, *id);
        }
    }

    #[test]
    fn test_closest_n_orders_by_distance() {
        let table = test_table();
        let target = NodeId::generate();

        for i in 0..200 {
            table.insert(NodeId::generate(), test_addr(9001 + i), Duration::ZERO);
        }

        let closest = table.closest_n(target.as_bytes(), 10);
        assert!(!closest.is_empty());

        for pair in closest.windows(2) {
            let d0 = distance(pair[0].id.as_bytes(), target.as_bytes());
            let d1 = distance(pair[1].id.as_bytes(), target.as_bytes());
            assert!(d0 >= d1);
        }

        // verify against a full scan of the table
        let mut all = Vec::new();
        for i in 0..KEY_BITS {
            all.extend(table.bucket_contacts(i));
        }
        all.sort_by(|a, b| {
            distance(b.id.as_bytes(), target.as_bytes())
                .cmp(&distance(a.id.as_bytes(), target.as_bytes()))
        });

        assert_eq!(
            distance(closest[0].id.as_bytes(), target.as_bytes()),
            distance(all[0].id.as_bytes(), target.as_bytes())
        );
    }

    #[test]
    fn test_closest_n_on_empty_table() {
        let table = test_table();
        assert!(table.closest_n(NodeId::generate().as_bytes(), 3).is_empty());
    }

    #[test]
    fn test_full_bucket_stashes_in_promotion_cache() {
        let local = Contact::new(NodeId([0u8; 32]), test_addr(9000));
        let table = RoutingTable::new(local, Duration::from_secs(60));
        let gen = IdGen::seeded(3);

        // fill a single bucket beyond capacity
        let mut ids = Vec::new();
        for i in 0..K + 5 {
            let id = gen.random_id_in_bucket(&[0u8; 32], 10);
            ids.push(id);
            table.insert(id, test_addr(9001 + i as u16), Duration::ZERO);
        }

        assert_eq!(table.bucket_len(10), K);

        // overflow candidates are cached, not members
        assert!(!table
            .bucket_contacts(10)
            .iter()
            .any(|c| c.id == ids[K + 2]));

        // removing a member promotes the oldest cached candidate
        table.remove(&ids[0]);
        assert_eq!(table.bucket_len(10), K);
        assert!(table
            .bucket_contacts(10)
            .iter()
            .any(|c| c.id == ids[K]));
    }

    #[test]
    fn test_neighbours_counts_members_only() {
        let table = test_table();

        for i in 0..20 {
            table.insert(NodeId::generate(), test_addr(9001 + i), Duration::ZERO);
        }

        assert_eq!(table.neighbours(), 20);
    }
}
