//! Latency-aware route selection
//!
//! Measures per-peer round-trip time with PING probes and produces an
//! alternative candidate ordering for lookup seeding: ascending by
//! latency, with peers above the threshold excluded. A periodic
//! refresher keeps the routing table's recorded latencies current.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

use crate::listener::Listener;
use crate::node::{Contact, IdGen, Key, NodeId};
use crate::protocol;
use crate::routing::RoutingTable;
use crate::KEY_BITS;

/// How often every known peer is re-measured
pub const LATENCY_REFRESH_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// The latency reported for unreachable peers
pub const FAILURE_LATENCY: Duration = Duration::from_secs(3600);

/// How probes are answered
pub(crate) enum ProbeMode {
    /// Measure over the network with PING round trips
    Network,
    /// Trust the latencies already recorded in the routing table;
    /// used when probing is impossible or undesired
    #[allow(dead_code)]
    Recorded,
}

/// Selects routes by measured round-trip time
pub(crate) struct LatencyRouter {
    routing: Arc<RoutingTable>,
    listeners: Vec<Arc<Listener>>,
    ids: Arc<IdGen>,
    local_id: NodeId,
    threshold: Duration,
    mode: ProbeMode,
    counter: AtomicU32,
}

impl LatencyRouter {
    pub fn new(
        routing: Arc<RoutingTable>,
        listeners: Vec<Arc<Listener>>,
        ids: Arc<IdGen>,
        local_id: NodeId,
        threshold: Duration,
        mode: ProbeMode,
    ) -> Self {
        Self {
            routing,
            listeners,
            ids,
            local_id,
            threshold,
            mode,
            counter: AtomicU32::new(0),
        }
    }

    fn next_listener(&self) -> &Arc<Listener> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) as usize % self.listeners.len();
        &self.listeners[index]
    }

    /// Measure one peer's round-trip time. Unreachable or over-threshold
    /// peers report the failure sentinel and have their failure count
    /// bumped.
    pub async fn measure(&self, contact: &Contact) -> Duration {
        if matches!(self.mode, ProbeMode::Recorded) {
            if contact.latency.is_zero() {
                return FAILURE_LATENCY;
            }
            return contact.latency;
        }

        let start = Instant::now();
        let (tx, rx) = oneshot::channel();

        let rid = self.ids.request_id();
        let req = match protocol::ping(&rid, self.local_id) {
            Ok(req) => req,
            Err(_) => return FAILURE_LATENCY,
        };

        let mut tx = Some(tx);
        let sent = self.next_listener().request(
            contact.address,
            &rid,
            &req,
            Box::new(move |result| {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(result.is_ok());
                }
                true
            }),
        );

        if sent.is_err() {
            self.routing.record_failure(&contact.id);
            return FAILURE_LATENCY;
        }

        match tokio::time::timeout(self.threshold, rx).await {
            Ok(Ok(true)) => start.elapsed(),
            _ => {
                self.routing.record_failure(&contact.id);
                FAILURE_LATENCY
            }
        }
    }

    /// The up-to-`count` peers nearest `target` by round-trip time,
    /// measured in parallel, excluding any peer above the threshold
    pub async fn best_routes(self: &Arc<Self>, target: &Key, count: usize) -> Vec<Contact> {
        let contacts = self.routing.closest_n(target, count * 2);
        if contacts.is_empty() {
            return Vec::new();
        }

        let mut probes = Vec::with_capacity(contacts.len());

        for contact in contacts {
            let router = self.clone();
            probes.push(tokio::spawn(async move {
                let latency = router.measure(&contact).await;
                (contact, latency)
            }));
        }

        let mut measured = Vec::with_capacity(probes.len());
        for probe in probes {
            if let Ok(result) = probe.await {
                measured.push(result);
            }
        }

        measured.sort_by_key(|(_, latency)| *latency);

        measured
            .into_iter()
            .filter(|(_, latency)| *latency < self.threshold)
            .take(count)
            .map(|(mut contact, latency)| {
                contact.latency = latency;
                contact
            })
            .collect()
    }

    /// Periodically re-measure every bucket member and record the result
    pub async fn refresh_loop(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + LATENCY_REFRESH_INTERVAL;
        let mut timer = tokio::time::interval_at(start, LATENCY_REFRESH_INTERVAL);

        loop {
            tokio::select! {
                _ = quit.changed() => return,
                _ = timer.tick() => {
                    debug!("refreshing peer latencies");
                    self.refresh_all().await;
                }
            }
        }
    }

    async fn refresh_all(self: &Arc<Self>) {
        for index in 0..KEY_BITS {
            for contact in self.routing.bucket_contacts(index) {
                let latency = self.measure(&contact).await;

                if latency < FAILURE_LATENCY {
                    trace!(peer = %contact.id, ?latency, "measured peer");
                    self.routing.update_latency(&contact.id, latency);
                }
            }
        }
    }
}
