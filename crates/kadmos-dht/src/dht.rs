//! DHT coordinator
//!
//! Assembles the routing table, request cache, packet manager, storage
//! and listeners; exposes store/find; and drives the bootstrap,
//! monitor, bucket-refresh, key-refresh and latency-refresh workflows.

use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use sha3::{Digest, Keccak256};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{RequestCache, ResponseCallback};
use crate::config::DhtConfig;
use crate::error::{DhtError, DhtResult};
use crate::journey::Journey;
use crate::latency::{LatencyRouter, ProbeMode};
use crate::listener::Listener;
use crate::node::{Contact, IdGen, Key, NodeId};
use crate::packet::PacketManager;
use crate::protocol;
use crate::routing::RoutingTable;
use crate::storage::{MemoryStorage, Storage};
use crate::{ALPHA, K, KEY_BITS, KEY_BYTES, VALUE_BYTES};

/// How often unseen peers are pinged
const MONITOR_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// How often every bucket is verified and refilled
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How often stored keys are re-replicated
const KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// How often expired values are purged from the default storage
const STORAGE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Callback invoked once per value a find yields, and once on failure
type FindCallback = Arc<dyn Fn(DhtResult<Vec<u8>>) + Send + Sync>;

/// Callback invoked once with a lookup's terminal outcome
type DoneCallback = Arc<dyn Fn(DhtResult<()>) + Send + Sync>;

/// A Kademlia-style DHT node
pub struct Dht {
    inner: Arc<DhtInner>,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct DhtInner {
    local: Contact,
    timeout: Duration,
    latency_routing: bool,
    routing: Arc<RoutingTable>,
    cache: Arc<RequestCache>,
    storage: Arc<dyn Storage>,
    listeners: Vec<Arc<Listener>>,
    latency: Arc<LatencyRouter>,
    ids: Arc<IdGen>,
    counter: AtomicU32,
}

impl Dht {
    /// Create a node, bind its listeners and bootstrap it into the
    /// network. Fails when no configured bootstrap address responds.
    pub async fn new(config: DhtConfig) -> DhtResult<Self> {
        config.validate()?;

        let local_id = config.local_id.unwrap_or_else(NodeId::generate);
        let bind_addr = resolve(&config.listen_address)?;

        let ids = Arc::new(IdGen::new());
        let cache = Arc::new(RequestCache::new());
        let packets = Arc::new(PacketManager::new());

        let memory = match &config.storage {
            Some(_) => None,
            None => Some(Arc::new(MemoryStorage::new())),
        };
        let storage: Arc<dyn Storage> = match &config.storage {
            Some(storage) => storage.clone(),
            None => memory.clone().unwrap_or_else(|| Arc::new(MemoryStorage::new())),
        };

        // the first socket fixes the port the remaining listeners share
        let first = crate::listener::bind_socket(bind_addr, config.socket_buffer_size)?;
        let local_addr = match first.local_addr() {
            Ok(SocketAddr::V4(addr)) => addr,
            Ok(addr) => return Err(DhtError::BindFailed(format!("bound to {addr}"))),
            Err(e) => return Err(DhtError::BindFailed(e.to_string())),
        };

        let local = Contact::new(local_id, local_addr);
        let routing = Arc::new(RoutingTable::new(local, config.node_expiry));

        // the local node lives in its own routing table
        routing.insert(local_id, local_addr, Duration::ZERO);

        let mut sockets = vec![first];
        for _ in 1..config.listeners {
            sockets.push(crate::listener::bind_socket(
                local_addr,
                config.socket_buffer_size,
            )?);
        }

        let listeners: Vec<Arc<Listener>> = sockets
            .into_iter()
            .map(|socket| {
                Arc::new(Listener::new(
                    socket,
                    config.socket_batch_size,
                    config.socket_batch_interval,
                    config.timeout,
                    local_id,
                    routing.clone(),
                    cache.clone(),
                    storage.clone(),
                    packets.clone(),
                    ids.clone(),
                ))
            })
            .collect();

        let latency = Arc::new(LatencyRouter::new(
            routing.clone(),
            listeners.clone(),
            ids.clone(),
            local_id,
            config.latency_threshold,
            ProbeMode::Network,
        ));

        let inner = Arc::new(DhtInner {
            local,
            timeout: config.timeout,
            latency_routing: config.latency_routing,
            routing,
            cache,
            storage,
            listeners,
            latency,
            ids,
            counter: AtomicU32::new(0),
        });

        let (quit, _) = watch::channel(false);
        let mut tasks = Vec::new();

        for listener in &inner.listeners {
            tasks.push(tokio::spawn(listener.clone().run(quit.subscribe())));
            tasks.push(tokio::spawn(listener.clone().flush_loop(quit.subscribe())));
        }

        tasks.push(tokio::spawn(sweep_cache(
            inner.cache.clone(),
            inner.timeout.min(Duration::from_secs(1)),
            quit.subscribe(),
        )));

        if let Some(memory) = memory {
            tasks.push(tokio::spawn(sweep_storage(memory, quit.subscribe())));
        }

        tasks.push(tokio::spawn(monitor(inner.clone(), quit.subscribe())));
        tasks.push(tokio::spawn(refresh_buckets(inner.clone(), quit.subscribe())));
        tasks.push(tokio::spawn(refresh_keys(inner.clone(), quit.subscribe())));
        tasks.push(tokio::spawn(
            inner.latency.clone().refresh_loop(quit.subscribe()),
        ));

        let dht = Self {
            inner,
            quit,
            tasks: Mutex::new(tasks),
        };

        info!(id = %local_id, address = %local_addr, "dht listening");

        if let Err(e) = dht.bootstrap(&config.bootstrap_addresses).await {
            dht.close().await;
            return Err(e);
        }

        Ok(dht)
    }

    /// The local node's id
    pub fn local_id(&self) -> NodeId {
        self.inner.local.id
    }

    /// The address the listeners are bound to
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.inner.local.address
    }

    /// The number of peers currently known
    pub fn neighbours(&self) -> usize {
        self.inner.routing.neighbours()
    }

    /// Store a value on the network under `key` for `ttl`. The callback
    /// receives the outcome exactly once.
    pub fn store(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
        callback: impl Fn(DhtResult<()>) + Send + Sync + 'static,
    ) {
        self.inner
            .store_value(key, value, SystemTime::now(), ttl, Arc::new(callback));
    }

    /// Find the values stored under `key`. The callback is invoked once
    /// per distinct value found, or once with an error.
    pub fn find(&self, key: &[u8], callback: impl Fn(DhtResult<Vec<u8>>) + Send + Sync + 'static) {
        self.inner.find_value(key, None, Arc::new(callback));
    }

    /// Like [`find`](Self::find), returning only values created at or
    /// after `from`. Useful for repeat queries that want to skip results
    /// they have already seen.
    pub fn find_from(
        &self,
        key: &[u8],
        from: SystemTime,
        callback: impl Fn(DhtResult<Vec<u8>>) + Send + Sync + 'static,
    ) {
        self.inner.find_value(key, Some(from), Arc::new(callback));
    }

    /// Shut the node down: signal every task, then wait for all of them
    /// to exit before closing storage
    pub async fn close(&self) {
        let _ = self.quit.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }

        self.inner.storage.close();
        debug!(id = %self.inner.local.id, "dht closed");
    }

    /// Issue `FIND_NODE(local_id)` to every bootstrap address and wait
    /// for the resulting lookup to succeed or exhaust itself
    async fn bootstrap(&self, addresses: &[String]) -> DhtResult<()> {
        if addresses.is_empty() {
            return Ok(());
        }

        let target = *self.inner.local.id.as_bytes();
        let journey = Arc::new(Journey::new(self.inner.local.id, target, K));

        let (tx, mut rx) = mpsc::channel::<DhtResult<()>>(addresses.len());
        let done: DoneCallback = Arc::new(move |result| {
            let _ = tx.try_send(result);
        });

        for address in addresses {
            let addr = resolve(address)?;

            let rid = self.inner.ids.request_id();
            let req = protocol::find_node_request(&rid, self.inner.local.id, &target)?;
            let callback = self
                .inner
                .find_node_callback(None, target, done.clone(), journey.clone());

            // credit the request before it can possibly be answered
            journey.begin(1);

            if let Err(e) = self
                .inner
                .next_listener()
                .request(addr, &rid, &req, callback)
            {
                journey.response_received();
                warn!(address = %address, error = %e, "bootstrap send failed");
            }
        }

        drop(done);

        // a successful journey reports once; an exhausted one surfaces
        // the first terminal failure once. Cap the wait in case neither
        // ever fires.
        let deadline = self.inner.timeout * 2;

        match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(Some(Ok(()))) => {
                info!(peers = self.inner.routing.neighbours(), "bootstrap complete");
                Ok(())
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, "bootstrap failed");
                Err(DhtError::BootstrapFailed)
            }
            _ => Err(DhtError::BootstrapFailed),
        }
    }
}

impl DhtInner {
    fn next_listener(&self) -> &Arc<Listener> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) as usize % self.listeners.len();
        &self.listeners[index]
    }

    /// Store `value` under `key` on the K closest nodes
    fn store_value(
        self: &Arc<Self>,
        key: &[u8],
        value: &[u8],
        created: SystemTime,
        ttl: Duration,
        callback: DoneCallback,
    ) {
        let Ok(key) = Key::try_from(key) else {
            callback(Err(DhtError::BadKey {
                expected: KEY_BYTES,
                actual: key.len(),
            }));
            return;
        };

        if value.len() > VALUE_BYTES {
            callback(Err(DhtError::BadValue {
                max: VALUE_BYTES,
                actual: value.len(),
            }));
            return;
        }

        let closest = self.routing.closest_n(&key, K);
        if closest.is_empty() {
            callback(Err(DhtError::NoNodes));
            return;
        }

        let wire = protocol::WireValue {
            key,
            value: value.to_vec(),
            ttl: protocol::duration_nanos(ttl),
            created: protocol::unix_nanos(created),
        };

        let remote: Vec<&Contact> = closest
            .iter()
            .filter(|contact| contact.id != self.local.id)
            .collect();

        // the local node is among the closest: persist right away
        if remote.len() < closest.len() {
            self.storage.set(&key, value, created, ttl);

            if remote.is_empty() {
                // we are the only node
                callback(Ok(()));
                return;
            }
        }

        let expected = (closest.len() - 1).max(1);
        let acks = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(AtomicBool::new(false));

        let deliver = {
            let delivered = delivered.clone();
            move |result: DhtResult<()>| {
                if !delivered.swap(true, Ordering::SeqCst) {
                    callback(result);
                }
            }
        };

        for contact in remote {
            let rid = self.ids.request_id();
            let req = match protocol::store_request(&rid, self.local.id, vec![wire.clone()]) {
                Ok(req) => req,
                Err(e) => {
                    deliver(Err(e));
                    return;
                }
            };

            self.routing.touch_pending(&contact.id);

            let response: ResponseCallback = {
                let inner = self.clone();
                let peer = contact.id;
                let acks = acks.clone();
                let deliver = deliver.clone();

                Box::new(move |result: DhtResult<&protocol::Event>| {
                    match result {
                        Err(e) => {
                            if e == DhtError::RequestTimeout {
                                inner.routing.remove(&peer);
                            }
                            // surface the first failure
                            deliver(Err(e));
                        }
                        Ok(_) => {
                            if acks.fetch_add(1, Ordering::SeqCst) + 1 == expected {
                                deliver(Ok(()));
                            }
                        }
                    }
                    true
                })
            };

            if let Err(e) = self
                .next_listener()
                .request(contact.address, &rid, &req, response)
            {
                deliver(Err(e));
                return;
            }
        }
    }

    /// Find values for `key`, checking local storage before running an
    /// iterative lookup
    fn find_value(self: &Arc<Self>, key: &[u8], from: Option<SystemTime>, callback: FindCallback) {
        let Ok(key) = Key::try_from(key) else {
            callback(Err(DhtError::BadKey {
                expected: KEY_BYTES,
                actual: key.len(),
            }));
            return;
        };

        if let Some(values) = self.storage.get(&key, from) {
            for value in values {
                callback(Ok(value.value));
            }
            return;
        }

        if self.latency_routing {
            // seed from the lowest-latency peers; measurement is
            // asynchronous, so the lookup continues off-task
            let inner = self.clone();
            tokio::spawn(async move {
                let mut seeds = inner.latency.best_routes(&key, ALPHA).await;
                if seeds.is_empty() {
                    seeds = inner.routing.closest_n(&key, K);
                }
                inner.start_find(key, from, seeds, callback);
            });
            return;
        }

        let seeds = self.routing.closest_n(&key, K);
        self.start_find(key, from, seeds, callback);
    }

    fn start_find(
        self: &Arc<Self>,
        key: Key,
        from: Option<SystemTime>,
        seeds: Vec<Contact>,
        callback: FindCallback,
    ) {
        if seeds.is_empty() {
            callback(Err(DhtError::NoNodes));
            return;
        }

        let journey = Arc::new(Journey::new(self.local.id, key, K));
        journey.add(&seeds);

        let next = journey.next(ALPHA);
        if next.is_empty() {
            callback(Err(DhtError::NoNodes));
            return;
        }

        for contact in next {
            if let Err(e) = self.send_find_value(&contact, from, callback.clone(), journey.clone())
            {
                if journey.finish(true) {
                    callback(Err(e));
                }
                return;
            }
        }
    }

    fn send_find_value(
        self: &Arc<Self>,
        contact: &Contact,
        from: Option<SystemTime>,
        callback: FindCallback,
        journey: Arc<Journey>,
    ) -> DhtResult<()> {
        let rid = self.ids.request_id();
        let req = protocol::find_value_request(&rid, self.local.id, journey.destination(), from)?;

        self.routing.touch_pending(&contact.id);

        let response = self.find_value_callback(contact.id, from, callback, journey);
        self.next_listener()
            .request(contact.address, &rid, &req, response)
    }

    /// The response handler for one FIND_VALUE request. Delivers fresh
    /// values to the user, expands the journey with newly discovered
    /// nodes, and surfaces the terminal outcome exactly once.
    fn find_value_callback(
        self: &Arc<Self>,
        peer: NodeId,
        from: Option<SystemTime>,
        callback: FindCallback,
        journey: Arc<Journey>,
    ) -> ResponseCallback {
        let inner = self.clone();
        let mut responded = false;

        Box::new(move |result| {
            // chunked responses share a request id; only the first one
            // settles the inflight accounting
            let (completed, should_error) = if responded {
                (journey.completed(), false)
            } else {
                responded = true;
                journey.response_received()
            };

            let event = match result {
                Err(e) => {
                    if e == DhtError::RequestTimeout {
                        inner.routing.remove(&peer);
                    }

                    if completed {
                        return true;
                    }

                    // the first failure after the frontier is exhausted
                    // surfaces; earlier ones are absorbed while other
                    // branches remain live
                    if should_error && journey.finish(true) {
                        callback(Err(e));
                    }

                    return true;
                }
                Ok(event) => event,
            };

            if completed {
                return true;
            }

            let payload = match event.find_value() {
                Ok(payload) => payload,
                Err(e) => {
                    if journey.finish(true) {
                        callback(Err(e));
                    }
                    return true;
                }
            };

            if !payload.values.is_empty() {
                journey.add_outstanding(event.sender, payload.found);
                journey.remove_outstanding(event.sender, payload.values.len() as i64);

                for value in &payload.values {
                    if !journey.seen_value(&value.value) {
                        callback(Ok(value.value.clone()));
                    }
                }

                if journey.finish(false) {
                    return true;
                }

                // stay registered while this peer still owes chunks
                return journey.outstanding_for(&event.sender) <= 0;
            }

            if payload.nodes.is_empty() {
                if journey.finish(false) {
                    callback(Err(DhtError::ValueNotFound));
                }
                return true;
            }

            // no value here; expand the journey with the peer's closest
            // nodes and fan out again
            let contacts: Vec<Contact> = payload.nodes.iter().map(|n| n.contact()).collect();
            journey.add(&contacts);

            let next = journey.next(ALPHA);
            if next.is_empty() {
                if journey.finish(false) {
                    callback(Err(DhtError::ValueNotFound));
                }
                return true;
            }

            for contact in next {
                if let Err(e) =
                    inner.send_find_value(&contact, from, callback.clone(), journey.clone())
                {
                    if journey.finish(true) {
                        callback(Err(e));
                    }
                    return true;
                }
            }

            true
        })
    }

    /// Run a node lookup towards `target`, inserting every discovered
    /// node into the routing table
    fn lookup_nodes(self: &Arc<Self>, target: Key, done: DoneCallback) {
        let seeds = self.routing.closest_n(&target, K);

        let journey = Arc::new(Journey::new(self.local.id, target, K));
        journey.add(&seeds);

        let next = journey.next(ALPHA);
        if next.is_empty() {
            done(Err(DhtError::NoNodes));
            return;
        }

        for contact in next {
            if let Err(e) = self.send_find_node(&contact, target, done.clone(), journey.clone()) {
                if journey.finish(true) {
                    done(Err(e));
                }
                return;
            }
        }
    }

    fn send_find_node(
        self: &Arc<Self>,
        contact: &Contact,
        target: Key,
        done: DoneCallback,
        journey: Arc<Journey>,
    ) -> DhtResult<()> {
        let rid = self.ids.request_id();
        let req = protocol::find_node_request(&rid, self.local.id, &target)?;

        self.routing.touch_pending(&contact.id);

        let response = self.find_node_callback(Some(contact.id), target, done, journey);
        self.next_listener()
            .request(contact.address, &rid, &req, response)
    }

    /// The response handler for one FIND_NODE request
    fn find_node_callback(
        self: &Arc<Self>,
        peer: Option<NodeId>,
        target: Key,
        done: DoneCallback,
        journey: Arc<Journey>,
    ) -> ResponseCallback {
        let inner = self.clone();
        let mut responded = false;

        Box::new(move |result| {
            let (completed, should_error) = if responded {
                (journey.completed(), false)
            } else {
                responded = true;
                journey.response_received()
            };

            let event = match result {
                Err(e) => {
                    if e == DhtError::RequestTimeout {
                        if let Some(peer) = peer {
                            inner.routing.remove(&peer);
                        }
                    }

                    if completed {
                        return true;
                    }

                    if should_error && journey.finish(true) {
                        done(Err(e));
                    }

                    return true;
                }
                Ok(event) => event,
            };

            if completed {
                return true;
            }

            let payload = match event.find_node() {
                Ok(payload) => payload,
                Err(e) => {
                    if journey.finish(true) {
                        done(Err(e));
                    }
                    return true;
                }
            };

            let mut contacts = Vec::with_capacity(payload.nodes.len());
            for node in &payload.nodes {
                let contact = node.contact();
                inner
                    .routing
                    .insert(contact.id, contact.address, Duration::ZERO);
                contacts.push(contact);
            }

            journey.add(&contacts);

            let next = journey.next(ALPHA);
            if next.is_empty() {
                // the search is exhausted
                if journey.finish(false) {
                    done(Ok(()));
                }
                return true;
            }

            for contact in next {
                if let Err(e) =
                    inner.send_find_node(&contact, target, done.clone(), journey.clone())
                {
                    if journey.finish(true) {
                        done(Err(e));
                    }
                    return true;
                }
            }

            true
        })
    }

    /// PING a peer and wait for its PONG, refreshing it in the routing
    /// table on success
    async fn ping_peer(self: &Arc<Self>, contact: &Contact) -> bool {
        let rid = self.ids.request_id();
        let req = match protocol::ping(&rid, self.local.id) {
            Ok(req) => req,
            Err(_) => return false,
        };

        self.routing.touch_pending(&contact.id);

        let (tx, rx) = oneshot::channel();
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
            return false;
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(true)) => {
                self.routing.seen(&contact.id);
                true
            }
            _ => false,
        }
    }
}

/// PING peers that have gone unseen past the monitor window, removing
/// the ones that no longer answer
async fn monitor(inner: Arc<DhtInner>, mut quit: watch::Receiver<bool>) {
    let start = tokio::time::Instant::now() + MONITOR_INTERVAL;
    let mut timer = tokio::time::interval_at(start, MONITOR_INTERVAL);

    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = timer.tick() => {
                let stale = inner.routing.stale_contacts(MONITOR_INTERVAL);

                debug!(count = stale.len(), "monitoring unseen peers");

                for contact in stale {
                    let rid = inner.ids.request_id();
                    let req = match protocol::ping(&rid, inner.local.id) {
                        Ok(req) => req,
                        Err(_) => continue,
                    };

                    let routing = inner.routing.clone();
                    let peer = contact.id;

                    let result = inner.next_listener().request(
                        contact.address,
                        &rid,
                        &req,
                        Box::new(move |result| {
                            match result {
                                Ok(_) => {
                                    routing.seen(&peer);
                                }
                                Err(DhtError::RequestTimeout) => {
                                    routing.remove(&peer);
                                }
                                Err(e) => warn!(peer = %peer, error = %e, "monitor ping failed"),
                            }
                            true
                        }),
                    );

                    if let Err(e) = result {
                        warn!(peer = %contact.id, error = %e, "monitor send failed");
                    }
                }
            }
        }
    }
}

/// Verify every bucket member with a PING and refill buckets that have
/// fallen below capacity with a lookup on a random in-range id
async fn refresh_buckets(inner: Arc<DhtInner>, mut quit: watch::Receiver<bool>) {
    let start = tokio::time::Instant::now() + BUCKET_REFRESH_INTERVAL;
    let mut timer = tokio::time::interval_at(start, BUCKET_REFRESH_INTERVAL);

    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = timer.tick() => {
                debug!("refreshing buckets");

                for index in 0..KEY_BITS {
                    for contact in inner.routing.bucket_contacts(index) {
                        if contact.id == inner.local.id {
                            continue;
                        }

                        if !inner.ping_peer(&contact).await {
                            inner.routing.remove(&contact.id);
                        }
                    }

                    if inner.routing.bucket_len(index) >= K {
                        continue;
                    }

                    let target = inner
                        .ids
                        .random_id_in_bucket(inner.local.id.as_bytes(), index);

                    inner.lookup_nodes(
                        *target.as_bytes(),
                        Arc::new(|result| {
                            if let Err(e) = result {
                                debug!(error = %e, "bucket refill lookup failed");
                            }
                        }),
                    );
                }
            }
        }
    }
}

/// Re-replicate every stored value that is still live, with its
/// remaining TTL
async fn refresh_keys(inner: Arc<DhtInner>, mut quit: watch::Receiver<bool>) {
    let start = tokio::time::Instant::now() + KEY_REFRESH_INTERVAL;
    let mut timer = tokio::time::interval_at(start, KEY_REFRESH_INTERVAL);

    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = timer.tick() => {
                let now = SystemTime::now();
                let mut live = Vec::new();

                inner.storage.iterate(&mut |value| {
                    if !value.is_expired(now) {
                        live.push(value.clone());
                    }
                    true
                });

                debug!(count = live.len(), "refreshing stored keys");

                for value in live {
                    let Ok(remaining) = value.expires.duration_since(now) else {
                        continue;
                    };

                    inner.store_value(
                        &value.key,
                        &value.value,
                        now,
                        remaining,
                        Arc::new({
                            let key = value.key;
                            move |result| {
                                if let Err(e) = result {
                                    warn!(key = %hex::encode(&key[..6]), error = %e, "key refresh failed");
                                }
                            }
                        }),
                    );
                }
            }
        }
    }
}

/// Expire pending requests past their deadline
async fn sweep_cache(
    cache: Arc<RequestCache>,
    period: Duration,
    mut quit: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = timer.tick() => {
                cache.sweep();
            }
        }
    }
}

/// Purge expired values from the default in-memory storage
async fn sweep_storage(storage: Arc<MemoryStorage>, mut quit: watch::Receiver<bool>) {
    let start = tokio::time::Instant::now() + STORAGE_SWEEP_INTERVAL;
    let mut timer = tokio::time::interval_at(start, STORAGE_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = timer.tick() => {
                storage.purge_expired();
            }
        }
    }
}

/// Derive a 32-byte DHT key from arbitrary input with Keccak-256
pub fn key(input: impl AsRef<[u8]>) -> Key {
    let mut hasher = Keccak256::new();
    hasher.update(input.as_ref());
    hasher.finalize().into()
}

/// Resolve a configured address string into an IPv4 socket address
fn resolve(address: &str) -> DhtResult<SocketAddrV4> {
    let mut addrs = address
        .to_socket_addrs()
        .map_err(|e| DhtError::Config(format!("{address}: {e}")))?;

    addrs
        .find_map(|addr| match addr {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| DhtError::Config(format!("{address}: no ipv4 address")))
}
