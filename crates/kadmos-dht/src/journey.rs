//! Iterative lookup driver
//!
//! A journey bounds a single lookup: it keeps a frontier of at most K
//! unvisited candidates ordered by XOR closeness to the destination,
//! limits the number of hop rounds, tracks requests in flight, and
//! deduplicates both visited peers and delivered values.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::node::{distance, Contact, Key, NodeId};
use crate::K;

struct JourneyState {
    /// id to skip, as it is this node
    source: NodeId,
    /// ids of every peer ever admitted to the frontier
    visited: HashSet<NodeId>,
    /// hashes of values already delivered to the caller
    values: HashSet<u64>,
    /// per-peer count of values still owed from advertised totals
    outstanding: HashMap<NodeId, i64>,
    /// candidate routes and their distances to the destination
    frontier: Vec<(Contact, usize)>,
    /// hop rounds left
    remaining: usize,
    /// requests sent but not yet answered
    inflight: usize,
    completed: bool,
}

/// One lookup in progress
pub struct Journey {
    destination: Key,
    state: Mutex<JourneyState>,
}

impl Journey {
    /// Create a journey from `source` towards `destination`, bounded to
    /// `hops` rounds of queries
    pub fn new(source: NodeId, destination: Key, hops: usize) -> Self {
        Self {
            destination,
            state: Mutex::new(JourneyState {
                source,
                visited: HashSet::new(),
                values: HashSet::new(),
                outstanding: HashMap::new(),
                frontier: Vec::with_capacity(K),
                remaining: hops,
                inflight: 0,
                completed: false,
            }),
        }
    }

    /// The key this journey is heading for
    pub fn destination(&self) -> &Key {
        &self.destination
    }

    /// Offer candidate routes. Peers already visited on this journey and
    /// the source itself are skipped. When the frontier is full, a
    /// candidate replaces the worst-ranked entry only if it is strictly
    /// closer to the destination.
    pub fn add(&self, contacts: &[Contact]) {
        let mut state = self.state.lock().unwrap();

        for contact in contacts {
            if contact.id == state.source || state.visited.contains(&contact.id) {
                continue;
            }

            state.visited.insert(contact.id);

            let d = distance(contact.id.as_bytes(), &self.destination);

            if state.frontier.len() < K {
                state.frontier.push((*contact, d));
                continue;
            }

            // find the current worst entry
            let mut worst: Option<(usize, usize)> = None;
            for (i, (_, dist)) in state.frontier.iter().enumerate() {
                match worst {
                    Some((_, wd)) if wd <= *dist => {}
                    _ => worst = Some((i, *dist)),
                }
            }

            if let Some((i, worst_d)) = worst {
                if worst_d < d {
                    // allow the evicted peer to be offered again later
                    let evicted = state.frontier[i].0.id;
                    state.visited.remove(&evicted);
                    state.frontier[i] = (*contact, d);
                }
            }
        }
    }

    /// Take up to `count` of the closest frontier entries for querying.
    /// Returns an empty set once the journey is complete, the hop limit
    /// is reached, or the frontier is exhausted.
    pub fn next(&self, count: usize) -> Vec<Contact> {
        let mut state = self.state.lock().unwrap();

        if state.remaining == 0 || state.frontier.is_empty() || state.completed {
            return Vec::new();
        }

        state.remaining -= 1;

        // closest first: larger shared prefix wins, ties go to the
        // lower-latency peer
        state.frontier.sort_by(|(a, da), (b, db)| {
            db.cmp(da).then_with(|| a.latency.cmp(&b.latency))
        });

        let available = count.min(state.frontier.len());
        state.inflight += available;

        state
            .frontier
            .drain(..available)
            .map(|(contact, _)| contact)
            .collect()
    }

    /// Credit requests issued outside [`next`](Self::next), such as the
    /// initial fan-out to bootstrap addresses whose ids are unknown
    pub fn begin(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.inflight += count;
    }

    /// Record a response (or terminal failure) for an inflight request.
    /// Returns the journey's completion status and whether the caller
    /// should surface an error: true once nothing is in flight and no
    /// routes remain.
    pub fn response_received(&self) -> (bool, bool) {
        let mut state = self.state.lock().unwrap();

        if state.inflight > 0 {
            state.inflight -= 1;
        }

        let should_error = state.inflight == 0 && state.frontier.is_empty();

        (state.completed, should_error)
    }

    /// Record the total number of values a peer has advertised. Only the
    /// first advertisement from each peer counts.
    pub fn add_outstanding(&self, peer: NodeId, found: i64) {
        let mut state = self.state.lock().unwrap();
        state.outstanding.entry(peer).or_insert(found);
    }

    /// Record values actually delivered by a peer
    pub fn remove_outstanding(&self, peer: NodeId, received: i64) {
        let mut state = self.state.lock().unwrap();
        *state.outstanding.entry(peer).or_insert(0) -= received;
    }

    /// Values still owed by a peer
    pub fn outstanding_for(&self, peer: &NodeId) -> i64 {
        let state = self.state.lock().unwrap();
        state.outstanding.get(peer).copied().unwrap_or(0)
    }

    /// Mark the journey completed. Without `force` the journey only
    /// finishes once nothing is in flight and no peer still owes values.
    /// Returns true only to the caller that actually flipped the state.
    pub fn finish(&self, force: bool) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.completed {
            return false;
        }

        if !force {
            let outstanding: i64 = state.outstanding.values().sum();

            if state.inflight > 0 || outstanding > 0 {
                return false;
            }
        }

        state.completed = true;
        true
    }

    /// Whether the journey has been completed
    pub fn completed(&self) -> bool {
        self.state.lock().unwrap().completed
    }

    /// Check-and-mark a delivered value, deduplicated by hash. Returns
    /// true when the value was already delivered on this journey.
    pub fn seen_value(&self, value: &[u8]) -> bool {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        value.hash(&mut hasher);
        let key = hasher.finish();

        let mut state = self.state.lock().unwrap();
        !state.values.insert(key)
    }
}
