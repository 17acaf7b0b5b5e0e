//! UDP listener
//!
//! Each listener owns one socket bound to the shared listen address
//! with port reuse, so several listeners service the same port. The
//! read path drains datagrams in batches and dispatches reassembled
//! events; the write path accumulates framed fragments into a batch
//! that is flushed when full or on a short timer.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::cache::{RequestCache, ResponseCallback};
use crate::error::{DhtError, DhtResult};
use crate::node::{distance, IdGen, Key, NodeId};
use crate::packet::{PacketManager, MAX_PACKET_SIZE};
use crate::protocol::{self, Event, EventKind, WireValue, MAX_EVENT_SIZE};
use crate::routing::RoutingTable;
use crate::storage::Storage;
use crate::K;

/// Framed fragments waiting to be written to the socket
#[derive(Default)]
struct WriteBatch {
    frames: VecDeque<(SocketAddrV4, Vec<u8>)>,
}

/// One UDP socket and its read/write machinery
pub(crate) struct Listener {
    socket: UdpSocket,
    routing: Arc<RoutingTable>,
    cache: Arc<RequestCache>,
    storage: Arc<dyn Storage>,
    packets: Arc<PacketManager>,
    ids: Arc<IdGen>,
    local_id: NodeId,
    timeout: Duration,
    batch_size: usize,
    batch_interval: Duration,
    batch: Mutex<WriteBatch>,
}

impl Listener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: UdpSocket,
        batch_size: usize,
        batch_interval: Duration,
        timeout: Duration,
        local_id: NodeId,
        routing: Arc<RoutingTable>,
        cache: Arc<RequestCache>,
        storage: Arc<dyn Storage>,
        packets: Arc<PacketManager>,
        ids: Arc<IdGen>,
    ) -> Self {
        Self {
            socket,
            routing,
            cache,
            storage,
            packets,
            ids,
            local_id,
            timeout,
            batch_size,
            batch_interval,
            batch: Mutex::new(WriteBatch::default()),
        }
    }

    /// Read loop: drain up to a batch of datagrams every time the socket
    /// becomes readable, until shutdown
    pub async fn run(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = quit.changed() => return,
                ready = self.socket.readable() => {
                    if ready.is_err() {
                        return;
                    }

                    for _ in 0..self.batch_size {
                        match self.socket.try_recv_from(&mut buf) {
                            Ok((len, addr)) => self.handle_datagram(&buf[..len], addr),
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(e) => {
                                if *quit.borrow() {
                                    return;
                                }
                                warn!(error = %e, "socket read failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Flush loop: push out any partially filled write batch on a timer,
    /// until shutdown
    pub async fn flush_loop(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.batch_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = quit.changed() => return,
                _ = timer.tick() => {
                    let mut batch = self.batch.lock().unwrap();
                    if let Err(e) = self.flush(&mut batch) {
                        if *quit.borrow() {
                            return;
                        }
                        warn!(error = %e, "write batch flush failed");
                    }
                }
            }
        }
    }

    fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let SocketAddr::V4(addr) = addr else {
            trace!(%addr, "ignoring non-ipv4 datagram");
            return;
        };

        let packet = match self.packets.assemble(data) {
            Ok(Some(packet)) => packet,
            // more fragments outstanding
            Ok(None) => return,
            Err(e) => {
                debug!(%addr, error = %e, "dropping malformed fragment");
                return;
            }
        };

        let event = Event::decode(packet.data());
        self.packets.release(packet);

        let event = match event {
            Ok(event) => event,
            Err(e) => {
                debug!(%addr, error = %e, "dropping malformed event");
                return;
            }
        };

        // refresh the sender, inserting it when previously unknown
        let mut transfer_keys = false;

        if !self.routing.seen(&event.sender) {
            debug!(peer = %event.sender, %addr, "discovered new node");
            self.routing.insert(event.sender, addr, Duration::ZERO);
            transfer_keys = true;
        }

        if event.response {
            self.cache.dispatch(&event.id, Ok(&event));
            return;
        }

        let handled = match event.kind {
            EventKind::Ping => self.handle_ping(&event, addr),
            EventKind::Store => self.handle_store(&event, addr),
            EventKind::FindNode => self.handle_find_node(&event, addr),
            EventKind::FindValue => self.handle_find_value(&event, addr),
            // a PONG can only ever be a response
            EventKind::Pong => Ok(()),
        };

        if let Err(e) = handled {
            warn!(%addr, error = %e, "failed to handle request");
            return;
        }

        // a brand-new peer receives every stored key that sits closer to
        // it than to us
        if transfer_keys {
            self.transfer_keys(addr, &event.sender);
        }
    }

    fn handle_ping(&self, event: &Event, addr: SocketAddrV4) -> DhtResult<()> {
        let resp = protocol::pong(&event.id, self.local_id)?;
        self.write(addr, &event.id, &resp)
    }

    fn handle_store(&self, event: &Event, addr: SocketAddrV4) -> DhtResult<()> {
        let payload = event.store()?;

        for value in &payload.values {
            self.storage.set(
                &value.key,
                &value.value,
                value.created_at(),
                value.time_to_live(),
            );
        }

        trace!(peer = %event.sender, values = payload.values.len(), "stored values");

        let resp = protocol::store_response(&event.id, self.local_id)?;
        self.write(addr, &event.id, &resp)
    }

    fn handle_find_node(&self, event: &Event, addr: SocketAddrV4) -> DhtResult<()> {
        let payload = event.find_node()?;

        let closest = self.routing.closest_n(&payload.key, K);
        let resp = protocol::find_node_response(&event.id, self.local_id, &payload.key, &closest)?;

        self.write(addr, &event.id, &resp)
    }

    fn handle_find_value(&self, event: &Event, addr: SocketAddrV4) -> DhtResult<()> {
        let payload = event.find_value()?;

        let from = (payload.from != 0).then(|| protocol::from_unix_nanos(payload.from));

        let Some(values) = self.storage.get(&payload.key, from) else {
            // nothing stored here; point the requester at the closest
            // peers we know instead
            let closest = self.routing.closest_n(&payload.key, K);
            let resp =
                protocol::find_value_not_found(&event.id, self.local_id, &payload.key, &closest)?;
            return self.write(addr, &event.id, &resp);
        };

        // stream the values back in chunks bounded by the event size
        let total = values.len() as i64;
        let mut chunk: Vec<WireValue> = Vec::new();
        let mut size = 0usize;

        for value in &values {
            if size >= MAX_EVENT_SIZE && !chunk.is_empty() {
                let resp = protocol::find_value_found(
                    &event.id,
                    self.local_id,
                    &payload.key,
                    std::mem::take(&mut chunk),
                    total,
                )?;
                self.write(addr, &event.id, &resp)?;
                size = 0;
            }

            let wire = WireValue::from_value(value);
            size += wire.wire_size();
            chunk.push(wire);
        }

        if !chunk.is_empty() {
            let resp = protocol::find_value_found(
                &event.id,
                self.local_id,
                &payload.key,
                chunk,
                total,
            )?;
            self.write(addr, &event.id, &resp)?;
        }

        Ok(())
    }

    /// Forward every stored value that is closer to the newly discovered
    /// peer than to us (or everything, while the network is smaller than
    /// the replication factor) in batched STORE requests
    fn transfer_keys(&self, to: SocketAddrV4, peer: &NodeId) {
        let transfer_all = self.routing.neighbours() < K;

        let mut chunk: Vec<WireValue> = Vec::new();
        let mut size = 0usize;
        let mut failed = false;

        self.storage.iterate(&mut |value| {
            let ours = distance(self.local_id.as_bytes(), &value.key);
            let theirs = distance(peer.as_bytes(), &value.key);

            if !transfer_all && theirs <= ours {
                return true;
            }

            if size >= MAX_EVENT_SIZE && !chunk.is_empty() {
                if let Err(e) = self.send_store_batch(to, std::mem::take(&mut chunk)) {
                    warn!(%to, error = %e, "key transfer failed");
                    failed = true;
                    return false;
                }
                size = 0;
            }

            let wire = WireValue::from_value(value);
            size += wire.wire_size();
            chunk.push(wire);

            true
        });

        if failed || chunk.is_empty() {
            return;
        }

        debug!(peer = %peer, %to, "transferring keys to new peer");

        if let Err(e) = self.send_store_batch(to, chunk) {
            warn!(%to, error = %e, "key transfer failed");
        }
    }

    fn send_store_batch(&self, to: SocketAddrV4, values: Vec<WireValue>) -> DhtResult<()> {
        let rid = self.ids.request_id();
        let req = protocol::store_request(&rid, self.local_id, values)?;

        self.request(
            to,
            &rid,
            &req,
            Box::new(move |result| {
                if let Err(e) = result {
                    warn!(%to, error = %e, "key transfer store failed");
                }
                true
            }),
        )
    }

    /// Register a response callback with a deadline, then write the
    /// request. The entry is withdrawn if the write fails, so the error
    /// surfaces exactly once.
    pub fn request(
        &self,
        to: SocketAddrV4,
        id: &Key,
        data: &[u8],
        callback: ResponseCallback,
    ) -> DhtResult<()> {
        self.cache.set(id, Instant::now() + self.timeout, callback);

        if let Err(e) = self.write(to, id, data) {
            self.cache.remove(id);
            return Err(e);
        }

        Ok(())
    }

    /// Fragment a message and append its frames to the write batch,
    /// flushing whenever the batch is full
    pub fn write(&self, to: SocketAddrV4, id: &Key, data: &[u8]) -> DhtResult<()> {
        let mut packet = self.packets.fragment(id, data)?;

        let mut batch = self.batch.lock().unwrap();

        while let Some(frame) = packet.next() {
            batch.frames.push_back((to, frame.to_vec()));

            if batch.frames.len() >= self.batch_size {
                self.flush(&mut batch)?;
            }
        }

        drop(batch);
        self.packets.release(packet);

        Ok(())
    }

    /// Write out queued frames in order. A full socket buffer leaves the
    /// remainder queued for the next flush tick.
    fn flush(&self, batch: &mut WriteBatch) -> DhtResult<()> {
        while let Some((to, frame)) = batch.frames.front() {
            match self.socket.try_send_to(frame, SocketAddr::V4(*to)) {
                Ok(_) => {
                    batch.frames.pop_front();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(DhtError::transport(e)),
            }
        }

        Ok(())
    }
}

/// Build a UDP socket with address and port reuse so several listeners
/// can share one port, sized buffers, and non-blocking mode for tokio
pub(crate) fn bind_socket(address: SocketAddrV4, buffer_size: usize) -> DhtResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DhtError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| DhtError::BindFailed(e.to_string()))?;

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(|e| DhtError::BindFailed(e.to_string()))?;

    socket
        .set_recv_buffer_size(buffer_size)
        .map_err(|e| DhtError::BindFailed(e.to_string()))?;
    socket
        .set_send_buffer_size(buffer_size)
        .map_err(|e| DhtError::BindFailed(e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| DhtError::BindFailed(e.to_string()))?;

    socket
        .bind(&SocketAddr::V4(address).into())
        .map_err(|e| DhtError::BindFailed(e.to_string()))?;

    UdpSocket::from_std(socket.into()).map_err(|e| DhtError::BindFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Contact;
    use crate::packet::{MAX_PAYLOAD_SIZE, PACKET_HEADER_SIZE};
    use crate::storage::MemoryStorage;
    use tokio::time::timeout;

    fn local(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    fn test_listener(batch_size: usize) -> (Listener, Arc<RequestCache>) {
        let socket = bind_socket(local(0), 1 << 16).unwrap();
        let id = NodeId::generate();
        let routing = Arc::new(RoutingTable::new(
            Contact::new(id, local(0)),
            Duration::from_secs(3600),
        ));
        let cache = Arc::new(RequestCache::new());

        let listener = Listener::new(
            socket,
            batch_size,
            Duration::from_millis(1),
            Duration::from_secs(1),
            id,
            routing,
            cache.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(PacketManager::new()),
            Arc::new(IdGen::seeded(31)),
        );

        (listener, cache)
    }

    async fn recv_frame(peer: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, _) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .expect("no frame arrived")
            .unwrap();
        buf.truncate(len);
        buf
    }

    #[tokio::test]
    async fn test_bind_shares_port() {
        let first = bind_socket(SocketAddrV4::new([127, 0, 0, 1].into(), 0), 1 << 16).unwrap();
        let addr = match first.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {other}"),
        };

        // a second socket binds the same port without error
        let second = bind_socket(addr, 1 << 16).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), addr.port());
    }

    #[tokio::test]
    async fn test_write_flushes_when_batch_fills() {
        // every frame fills the batch on its own
        let (listener, _) = test_listener(1);
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = match peer.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {other}"),
        };

        let id = [7u8; 32];
        listener.write(peer_addr, &id, &[42u8; 100]).unwrap();

        let frame = recv_frame(&peer).await;
        assert_eq!(frame.len(), 100 + PACKET_HEADER_SIZE);
        assert_eq!(&frame[..32], &id);
        assert_eq!(frame[32], 1);
        assert_eq!(frame[33], 1);
    }

    #[tokio::test]
    async fn test_partial_batch_waits_for_flush() {
        let (listener, _) = test_listener(64);
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = match peer.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {other}"),
        };

        let id = [8u8; 32];
        listener.write(peer_addr, &id, b"queued").unwrap();

        // nothing on the wire until the timer-driven flush
        let mut buf = [0u8; 64];
        assert!(
            timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
                .await
                .is_err()
        );

        let mut batch = listener.batch.lock().unwrap();
        listener.flush(&mut batch).unwrap();
        drop(batch);

        let frame = recv_frame(&peer).await;
        assert_eq!(&frame[PACKET_HEADER_SIZE..], b"queued");
    }

    #[tokio::test]
    async fn test_write_fragments_large_messages() {
        let (listener, _) = test_listener(1);
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = match peer.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {other}"),
        };

        let id = [9u8; 32];
        let data = vec![5u8; MAX_PAYLOAD_SIZE + 10];
        listener.write(peer_addr, &id, &data).unwrap();

        let first = recv_frame(&peer).await;
        let second = recv_frame(&peer).await;

        assert_eq!(first.len(), MAX_PACKET_SIZE);
        assert_eq!(first[32], 1);
        assert_eq!(first[33], 2);
        assert_eq!(second.len(), 10 + PACKET_HEADER_SIZE);
        assert_eq!(second[32], 2);

        // reassembling both frames yields the original message
        let packets = PacketManager::new();
        assert!(packets.assemble(&first).unwrap().is_none());
        let packet = packets.assemble(&second).unwrap().unwrap();
        assert_eq!(packet.data(), &data[..]);
    }

    #[tokio::test]
    async fn test_failed_request_withdraws_callback() {
        let (listener, cache) = test_listener(1);

        // a message too large to fragment never reaches the socket, and
        // the pending entry is withdrawn with it
        let id = [10u8; 32];
        let oversized = vec![0u8; MAX_PAYLOAD_SIZE * 256];

        let result = listener.request(
            local(9),
            &id,
            &oversized,
            Box::new(|_| panic!("callback must not run")),
        );

        assert!(result.is_err());
        assert!(cache.is_empty());
    }
}
