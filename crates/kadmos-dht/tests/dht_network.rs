//! End-to-end tests running real nodes over loopback UDP

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use kadmos_dht::packet::PacketManager;
use kadmos_dht::protocol::{self, Event, EventKind};
use kadmos_dht::{key, Dht, DhtConfig, DhtError, Key, NodeId};

fn test_config() -> DhtConfig {
    DhtConfig {
        listen_address: "127.0.0.1:0".to_string(),
        listeners: 2,
        timeout: Duration::from_secs(2),
        socket_buffer_size: 1024 * 1024,
        ..Default::default()
    }
}

fn bootstrap_config(seed: &Dht) -> DhtConfig {
    let mut config = test_config();
    config.bootstrap_addresses = vec![seed.local_addr().to_string()];
    config
}

async fn store(dht: &Dht, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), DhtError> {
    let (tx, mut rx) = mpsc::channel(1);

    dht.store(key, value, ttl, move |result| {
        let _ = tx.try_send(result);
    });

    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("store timed out")
        .expect("store callback dropped")
}

async fn find_one(dht: &Dht, key: &[u8]) -> Result<Vec<u8>, DhtError> {
    let (tx, mut rx) = mpsc::channel(16);

    dht.find(key, move |result| {
        let _ = tx.try_send(result);
    });

    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("find timed out")
        .expect("find callback dropped")
}

/// A bare-socket protocol client for exercising a node's listener
/// without a second DHT in the way
struct WireClient {
    socket: tokio::net::UdpSocket,
    packets: PacketManager,
    node_id: NodeId,
}

impl WireClient {
    async fn new() -> Self {
        Self {
            socket: tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            packets: PacketManager::new(),
            node_id: NodeId::generate(),
        }
    }

    fn request_id(&self) -> Key {
        *NodeId::generate().as_bytes()
    }

    async fn request(&self, to: SocketAddrV4, id: &[u8; 32], data: &[u8]) -> Vec<Event> {
        let mut packet = self.packets.fragment(id, data).unwrap();
        while let Some(frame) = packet.next() {
            self.socket
                .send_to(frame, SocketAddr::V4(to))
                .await
                .unwrap();
        }

        // gather response events for this id until the socket goes quiet
        let mut events = Vec::new();
        let mut buf = vec![0u8; 1500];

        loop {
            let received =
                timeout(Duration::from_millis(500), self.socket.recv_from(&mut buf)).await;

            let Ok(Ok((len, _))) = received else {
                break;
            };

            if let Some(packet) = self.packets.assemble(&buf[..len]).unwrap() {
                let event = Event::decode(packet.data()).unwrap();
                if &event.id == id {
                    events.push(event);
                }
            }
        }

        events
    }
}

#[tokio::test]
async fn test_single_node_store_find() {
    let dht = Dht::new(test_config()).await.unwrap();

    let k = key("k");
    store(&dht, &k, b"v", Duration::from_secs(3600))
        .await
        .unwrap();

    let value = find_one(&dht, &k).await.unwrap();
    assert_eq!(value, b"v");

    dht.close().await;
}

#[tokio::test]
async fn test_store_rejects_bad_arguments() {
    let dht = Dht::new(test_config()).await.unwrap();

    let result = store(&dht, b"short", b"v", Duration::from_secs(60)).await;
    assert!(matches!(result, Err(DhtError::BadKey { .. })));

    let oversized = vec![0u8; 32 * 1024 + 1];
    let result = store(&dht, &key("big"), &oversized, Duration::from_secs(60)).await;
    assert!(matches!(result, Err(DhtError::BadValue { .. })));

    let result = find_one(&dht, b"short").await;
    assert!(matches!(result, Err(DhtError::BadKey { .. })));

    dht.close().await;
}

#[tokio::test]
async fn test_two_node_replication() {
    let a = Dht::new(test_config()).await.unwrap();
    let b = Dht::new(bootstrap_config(&a)).await.unwrap();

    // both nodes know each other after the bootstrap
    assert!(a.neighbours() >= 2);
    assert!(b.neighbours() >= 2);

    let k = key("k");
    store(&b, &k, b"v", Duration::from_secs(3600))
        .await
        .unwrap();

    // the value was replicated to a, so it answers from local storage
    let value = find_one(&a, &k).await.unwrap();
    assert_eq!(value, b"v");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_value_not_found() {
    let a = Dht::new(test_config()).await.unwrap();
    let b = Dht::new(bootstrap_config(&a)).await.unwrap();

    let result = find_one(&b, &key("missing")).await;
    assert_eq!(result, Err(DhtError::ValueNotFound));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_key_transfer_to_new_peer() {
    let a = Dht::new(test_config()).await.unwrap();
    let b = Dht::new(bootstrap_config(&a)).await.unwrap();

    let k = key("handover");
    store(&a, &k, b"payload", Duration::from_secs(3600))
        .await
        .unwrap();

    // a third node joining the network receives the stored keys while
    // the network is below the replication factor
    let c = Dht::new(bootstrap_config(&a)).await.unwrap();

    let mut found = None;
    for _ in 0..40 {
        if let Ok(value) = find_one(&c, &k).await {
            found = Some(value);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(found.as_deref(), Some(&b"payload"[..]));

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn test_fragmented_value_roundtrip() {
    let a = Dht::new(test_config()).await.unwrap();
    let b = Dht::new(bootstrap_config(&a)).await.unwrap();

    // three fragments worth of value, short tail included
    let payload: Vec<u8> = (0..4098u32).map(|i| (i % 251) as u8).collect();

    let k = key("fragmented");
    store(&b, &k, &payload, Duration::from_secs(3600))
        .await
        .unwrap();

    let value = find_one(&a, &k).await.unwrap();
    assert_eq!(value, payload);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_find_over_the_network() {
    let a = Dht::new(test_config()).await.unwrap();
    let c = Dht::new(bootstrap_config(&a)).await.unwrap();

    // plant the value on a only, so c has to look it up remotely
    let client = WireClient::new().await;
    let k = key("remote-only");
    let rid = client.request_id();
    let wire_value = protocol::WireValue {
        key: k,
        value: b"fetched remotely".to_vec(),
        ttl: 3_600_000_000_000,
        created: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as i64,
    };
    let req = protocol::store_request(&rid, client.node_id, vec![wire_value]).unwrap();

    let acks = client.request(a.local_addr(), &rid, &req).await;
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].kind, EventKind::Store);

    // c's local storage misses, so the journey queries a
    let value = find_one(&c, &k).await.unwrap();
    assert_eq!(value, b"fetched remotely");

    a.close().await;
    c.close().await;
}

#[tokio::test]
async fn test_unreachable_bootstrap_fails() {
    let mut config = test_config();
    config.timeout = Duration::from_millis(500);
    config.bootstrap_addresses = vec!["9.9.9.9:1".to_string()];

    let started = std::time::Instant::now();
    let result = Dht::new(config).await;

    assert!(matches!(result, Err(DhtError::BootstrapFailed)));
    // the failure surfaces via the request deadline, not a hang
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_wire_ping_pong() {
    let dht = Dht::new(test_config()).await.unwrap();
    let client = WireClient::new().await;

    let rid = client.request_id();
    let req = protocol::ping(&rid, client.node_id).unwrap();

    let events = client.request(dht.local_addr(), &rid, &req).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Pong);
    assert!(events[0].response);
    assert_eq!(events[0].sender, dht.local_id());

    dht.close().await;
}

#[tokio::test]
async fn test_wire_find_value_returns_stored() {
    let dht = Dht::new(test_config()).await.unwrap();

    let k = key("wire");
    store(&dht, &k, b"over the wire", Duration::from_secs(3600))
        .await
        .unwrap();

    let client = WireClient::new().await;
    let rid = client.request_id();
    let req = protocol::find_value_request(&rid, client.node_id, &k, None).unwrap();

    let events = client.request(dht.local_addr(), &rid, &req).await;

    assert!(!events.is_empty());
    let payload = events[0].find_value().unwrap();
    assert_eq!(payload.found, 1);
    assert_eq!(payload.values.len(), 1);
    assert_eq!(payload.values[0].value, b"over the wire");

    dht.close().await;
}

#[tokio::test]
async fn test_wire_find_node_returns_closest() {
    let a = Dht::new(test_config()).await.unwrap();
    let b = Dht::new(bootstrap_config(&a)).await.unwrap();

    let client = WireClient::new().await;
    let rid = client.request_id();
    let target = NodeId::generate();
    let req = protocol::find_node_request(&rid, client.node_id, target.as_bytes()).unwrap();

    let events = client.request(a.local_addr(), &rid, &req).await;

    assert_eq!(events.len(), 1);
    let payload = events[0].find_node().unwrap();

    // a knows itself, b and now the client
    let ids: Vec<NodeId> = payload.nodes.iter().map(|n| n.id).collect();
    assert!(ids.contains(&a.local_id()));
    assert!(ids.contains(&b.local_id()));

    a.close().await;
    b.close().await;
}
