//! Wire protocol
//!
//! After reassembly every datagram payload is an [`Event`]: a request or
//! response correlated by a 32-byte id, carrying one of the payload
//! tables below. Addresses travel as 6 bytes (IPv4 octets followed by a
//! little-endian port); timestamps and TTLs as nanoseconds.

use std::net::SocketAddrV4;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{DhtError, DhtResult};
use crate::node::{Contact, Key, NodeId};
use crate::storage::Value;

/// Responses streaming many values are split once their cumulative
/// payload reaches this size
pub const MAX_EVENT_SIZE: usize = 65_535 - 512;

/// Approximate per-value table overhead used when sizing batches
pub(crate) const VALUE_OVERHEAD: usize = 50;

/// The kind of message an event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Ping,
    Pong,
    Store,
    FindNode,
    FindValue,
}

/// A node endpoint on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNode {
    /// The node's id
    pub id: NodeId,
    /// IPv4 octets followed by the port in little-endian
    pub address: [u8; 6],
}

impl WireNode {
    pub fn new(id: NodeId, address: SocketAddrV4) -> Self {
        Self {
            id,
            address: encode_address(address),
        }
    }

    /// The endpoint as a socket address
    pub fn socket_address(&self) -> SocketAddrV4 {
        decode_address(&self.address)
    }

    /// A routing table contact for this endpoint
    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.socket_address())
    }
}

impl From<&Contact> for WireNode {
    fn from(contact: &Contact) -> Self {
        Self::new(contact.id, contact.address)
    }
}

/// A value on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireValue {
    /// The 256-bit key the value is stored under
    pub key: Key,
    /// The opaque value bytes
    pub value: Vec<u8>,
    /// Time to live in nanoseconds
    pub ttl: i64,
    /// Creation time in nanoseconds since the epoch
    pub created: i64,
}

impl WireValue {
    pub fn from_value(value: &Value) -> Self {
        Self {
            key: value.key,
            value: value.value.clone(),
            ttl: duration_nanos(value.ttl),
            created: unix_nanos(value.created),
        }
    }

    /// The creation timestamp as a system time
    pub fn created_at(&self) -> SystemTime {
        from_unix_nanos(self.created)
    }

    /// The time to live as a duration
    pub fn time_to_live(&self) -> Duration {
        Duration::from_nanos(self.ttl.max(0) as u64)
    }

    /// Wire size estimate used when batching values into events
    pub fn wire_size(&self) -> usize {
        self.key.len() + self.value.len() + VALUE_OVERHEAD
    }
}

/// FIND_NODE request and response payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodePayload {
    /// The target being looked up
    pub key: Key,
    /// The closest known nodes (response only)
    pub nodes: Vec<WireNode>,
}

/// FIND_VALUE request and response payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindValuePayload {
    /// The key being looked up
    pub key: Key,
    /// Matching values (response, when the key was found)
    pub values: Vec<WireValue>,
    /// Closest known nodes (response, when the key was not found)
    pub nodes: Vec<WireNode>,
    /// Only values created at or after this time are wanted, in
    /// nanoseconds since the epoch; zero means unfiltered
    pub from: i64,
    /// The total number of matching values the respondent holds
    pub found: i64,
}

/// STORE request payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePayload {
    /// The values to persist
    pub values: Vec<WireValue>,
}

/// The payload union, discriminated by the operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    FindNode(FindNodePayload),
    FindValue(FindValuePayload),
    Store(StorePayload),
}

/// One wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Correlates a request with its response(s)
    pub id: Key,
    /// The sender's node id
    pub sender: NodeId,
    /// What kind of message this is
    pub kind: EventKind,
    /// True when this replies to a prior request with the same id
    pub response: bool,
    /// The operation payload, absent for PING/PONG and STORE acks
    pub payload: Option<Payload>,
}

impl Event {
    /// Encode for the wire
    pub fn encode(&self) -> DhtResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DhtError::BadPayload(e.to_string()))
    }

    /// Decode from reassembled bytes
    pub fn decode(data: &[u8]) -> DhtResult<Self> {
        bincode::deserialize(data).map_err(|e| DhtError::BadPayload(e.to_string()))
    }

    /// The FIND_NODE payload, or a `BadPayload` error
    pub fn find_node(&self) -> DhtResult<&FindNodePayload> {
        match &self.payload {
            Some(Payload::FindNode(p)) => Ok(p),
            _ => Err(DhtError::BadPayload("missing find node payload".into())),
        }
    }

    /// The FIND_VALUE payload, or a `BadPayload` error
    pub fn find_value(&self) -> DhtResult<&FindValuePayload> {
        match &self.payload {
            Some(Payload::FindValue(p)) => Ok(p),
            _ => Err(DhtError::BadPayload("missing find value payload".into())),
        }
    }

    /// The STORE payload, or a `BadPayload` error
    pub fn store(&self) -> DhtResult<&StorePayload> {
        match &self.payload {
            Some(Payload::Store(p)) => Ok(p),
            _ => Err(DhtError::BadPayload("missing store payload".into())),
        }
    }
}

/// PING request
pub fn ping(id: &Key, sender: NodeId) -> DhtResult<Vec<u8>> {
    Event {
        id: *id,
        sender,
        kind: EventKind::Ping,
        response: false,
        payload: None,
    }
    .encode()
}

/// PONG response
pub fn pong(id: &Key, sender: NodeId) -> DhtResult<Vec<u8>> {
    Event {
        id: *id,
        sender,
        kind: EventKind::Pong,
        response: true,
        payload: None,
    }
    .encode()
}

/// STORE request carrying a batch of values
pub fn store_request(id: &Key, sender: NodeId, values: Vec<WireValue>) -> DhtResult<Vec<u8>> {
    Event {
        id: *id,
        sender,
        kind: EventKind::Store,
        response: false,
        payload: Some(Payload::Store(StorePayload { values })),
    }
    .encode()
}

/// STORE acknowledgement
pub fn store_response(id: &Key, sender: NodeId) -> DhtResult<Vec<u8>> {
    Event {
        id: *id,
        sender,
        kind: EventKind::Store,
        response: true,
        payload: None,
    }
    .encode()
}

/// FIND_NODE request for the nodes closest to `key`
pub fn find_node_request(id: &Key, sender: NodeId, key: &Key) -> DhtResult<Vec<u8>> {
    Event {
        id: *id,
        sender,
        kind: EventKind::FindNode,
        response: false,
        payload: Some(Payload::FindNode(FindNodePayload {
            key: *key,
            nodes: Vec::new(),
        })),
    }
    .encode()
}

/// FIND_NODE response listing the closest known nodes
pub fn find_node_response(
    id: &Key,
    sender: NodeId,
    key: &Key,
    contacts: &[Contact],
) -> DhtResult<Vec<u8>> {
    Event {
        id: *id,
        sender,
        kind: EventKind::FindNode,
        response: true,
        payload: Some(Payload::FindNode(FindNodePayload {
            key: *key,
            nodes: contacts.iter().map(WireNode::from).collect(),
        })),
    }
    .encode()
}

/// FIND_VALUE request for values stored under `key`
pub fn find_value_request(
    id: &Key,
    sender: NodeId,
    key: &Key,
    from: Option<SystemTime>,
) -> DhtResult<Vec<u8>> {
    Event {
        id: *id,
        sender,
        kind: EventKind::FindValue,
        response: false,
        payload: Some(Payload::FindValue(FindValuePayload {
            key: *key,
            values: Vec::new(),
            nodes: Vec::new(),
            from: from.map(unix_nanos).unwrap_or(0),
            found: 0,
        })),
    }
    .encode()
}

/// FIND_VALUE response carrying one chunk of matching values, with
/// `found` set to the respondent's total
pub fn find_value_found(
    id: &Key,
    sender: NodeId,
    key: &Key,
    values: Vec<WireValue>,
    found: i64,
) -> DhtResult<Vec<u8>> {
    Event {
        id: *id,
        sender,
        kind: EventKind::FindValue,
        response: true,
        payload: Some(Payload::FindValue(FindValuePayload {
            key: *key,
            values,
            nodes: Vec::new(),
            from: 0,
            found,
        })),
    }
    .encode()
}

/// FIND_VALUE response pointing at the closest known nodes instead
pub fn find_value_not_found(
    id: &Key,
    sender: NodeId,
    key: &Key,
    contacts: &[Contact],
) -> DhtResult<Vec<u8>> {
    Event {
        id: *id,
        sender,
        kind: EventKind::FindValue,
        response: true,
        payload: Some(Payload::FindValue(FindValuePayload {
            key: *key,
            values: Vec::new(),
            nodes: contacts.iter().map(WireNode::from).collect(),
            from: 0,
            found: 0,
        })),
    }
    .encode()
}

fn encode_address(address: SocketAddrV4) -> [u8; 6] {
    let mut bytes = [0u8; 6];
    bytes[..4].copy_from_slice(&address.ip().octets());
    bytes[4..].copy_from_slice(&address.port().to_le_bytes());
    bytes
}

fn decode_address(bytes: &[u8; 6]) -> SocketAddrV4 {
    let ip: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let port = u16::from_le_bytes([bytes[4], bytes[5]]);
    SocketAddrV4::new(ip.into(), port)
}

/// Nanoseconds since the epoch, saturating for pre-epoch times
pub(crate) fn unix_nanos(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// A system time from nanoseconds since the epoch
pub(crate) fn from_unix_nanos(nanos: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos.max(0) as u64)
}

pub(crate) fn duration_nanos(duration: Duration) -> i64 {
    duration.as_nanos().min(i64::MAX as u128) as i64
}
