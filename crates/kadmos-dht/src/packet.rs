//! Datagram fragmentation and reassembly
//!
//! Wire format of one fragment:
//! [request id: 32 bytes][fragment index: 1 byte, 1-based][fragment count: 1 byte]
//! followed by up to `MAX_PAYLOAD_SIZE` bytes of payload. Only the last
//! fragment of a message may be short.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::BufMut;

use crate::error::{DhtError, DhtResult};
use crate::node::Key;
use crate::KEY_BYTES;

/// Largest datagram put on the wire
pub const MAX_PACKET_SIZE: usize = 1500;

/// Fragment header: request id, fragment index, fragment count
pub const PACKET_HEADER_SIZE: usize = KEY_BYTES + 2;

/// Payload capacity of a single fragment
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE;

/// Fragment counts are a single byte
pub const MAX_FRAGMENTS: usize = 255;

/// A logical packet: either an outgoing message sliced into framed
/// fragments, or an incoming message being reassembled from them
pub struct Packet {
    id: Key,
    buf: Vec<u8>,
    /// total number of fragments
    fragments: usize,
    /// fragments received so far (assembly only)
    received: usize,
    /// per-fragment arrival bitmap (assembly only)
    bitmap: [u64; 4],
    /// total assembled payload length (assembly only)
    len: usize,
    /// read cursor over outgoing frames
    cursor: usize,
}

impl Packet {
    fn empty() -> Self {
        Self {
            id: [0u8; KEY_BYTES],
            buf: Vec::new(),
            fragments: 0,
            received: 0,
            bitmap: [0u64; 4],
            len: 0,
            cursor: 0,
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.fragments = 0;
        self.received = 0;
        self.bitmap = [0u64; 4];
        self.len = 0;
        self.cursor = 0;
    }

    /// The request id shared by every fragment of this packet
    pub fn id(&self) -> &Key {
        &self.id
    }

    /// The number of fragments this packet spans
    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// The next outgoing frame (header + payload), or None once every
    /// frame has been taken
    pub fn next(&mut self) -> Option<&[u8]> {
        if self.cursor >= self.fragments {
            return None;
        }

        let start = self.cursor * MAX_PACKET_SIZE;
        let end = if self.cursor == self.fragments - 1 {
            self.buf.len()
        } else {
            start + MAX_PACKET_SIZE
        };

        self.cursor += 1;

        Some(&self.buf[start..end])
    }

    /// The reassembled payload
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn mark(&mut self, index: usize) -> bool {
        let slot = &mut self.bitmap[index / 64];
        let bit = 1u64 << (index % 64);

        if *slot & bit != 0 {
            return false;
        }

        *slot |= bit;
        true
    }
}

/// Fragments outgoing messages and reassembles incoming ones, pooling
/// packet buffers between uses
pub struct PacketManager {
    pending: Mutex<HashMap<Key, Packet>>,
    pool: Mutex<Vec<Packet>>,
}

impl PacketManager {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            pool: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Packet {
        self.pool.lock().unwrap().pop().unwrap_or_else(Packet::empty)
    }

    /// Return a packet's buffers to the pool once its contents have been
    /// consumed
    pub fn release(&self, mut packet: Packet) {
        packet.reset();

        let mut pool = self.pool.lock().unwrap();
        if pool.len() < 64 {
            pool.push(packet);
        }
    }

    /// Whether a payload needs more than one fragment
    pub fn needs_fragmenting(&self, data: &[u8]) -> bool {
        data.len() > MAX_PAYLOAD_SIZE
    }

    /// Slice a message into framed fragments sharing the given request
    /// id. Fails when the message would span more than 255 fragments.
    pub fn fragment(&self, id: &Key, data: &[u8]) -> DhtResult<Packet> {
        let fragments = data.len().div_ceil(MAX_PAYLOAD_SIZE).max(1);

        if fragments > MAX_FRAGMENTS {
            return Err(DhtError::BadPayload(format!(
                "message of {} bytes exceeds {} fragments",
                data.len(),
                MAX_FRAGMENTS
            )));
        }

        let mut packet = self.take();
        packet.id = *id;
        packet.fragments = fragments;
        packet.buf.reserve(data.len() + fragments * PACKET_HEADER_SIZE);

        for index in 0..fragments {
            let start = index * MAX_PAYLOAD_SIZE;
            let end = data.len().min(start + MAX_PAYLOAD_SIZE);

            packet.buf.put_slice(id);
            packet.buf.put_u8((index + 1) as u8);
            packet.buf.put_u8(fragments as u8);
            packet.buf.put_slice(&data[start..end]);
        }

        Ok(packet)
    }

    /// Feed one received frame. Returns the whole packet once its last
    /// outstanding fragment arrives; duplicates are ignored.
    pub fn assemble(&self, frame: &[u8]) -> DhtResult<Option<Packet>> {
        if frame.len() < PACKET_HEADER_SIZE || frame.len() > MAX_PACKET_SIZE {
            return Err(DhtError::BadPayload(format!(
                "fragment of {} bytes",
                frame.len()
            )));
        }

        let mut id = [0u8; KEY_BYTES];
        id.copy_from_slice(&frame[..KEY_BYTES]);

        let index = frame[KEY_BYTES] as usize;
        let count = frame[KEY_BYTES + 1] as usize;
        let payload = &frame[PACKET_HEADER_SIZE..];

        if index == 0 || count == 0 || index > count {
            return Err(DhtError::BadPayload(format!(
                "fragment {index}/{count}"
            )));
        }

        // short fragments are only valid in the last position
        if index < count && payload.len() != MAX_PAYLOAD_SIZE {
            return Err(DhtError::BadPayload(format!(
                "short fragment {index}/{count}"
            )));
        }

        // single-fragment fast path
        if count == 1 {
            let mut packet = self.take();
            packet.id = id;
            packet.fragments = 1;
            packet.received = 1;
            packet.buf.put_slice(payload);
            packet.len = payload.len();
            return Ok(Some(packet));
        }

        let mut pending = self.pending.lock().unwrap();

        // the sender disagreeing with itself invalidates the whole packet
        if let Some(existing) = pending.get(&id) {
            if existing.fragments != count {
                pending.remove(&id);
                return Err(DhtError::BadPayload(format!(
                    "fragment count changed to {count}"
                )));
            }
        }

        let packet = pending.entry(id).or_insert_with(|| {
            let mut packet = Packet::empty();
            packet.id = id;
            packet.fragments = count;
            packet.buf.resize(count * MAX_PAYLOAD_SIZE, 0);
            packet
        });

        if !packet.mark(index - 1) {
            // duplicate fragment
            return Ok(None);
        }

        let offset = (index - 1) * MAX_PAYLOAD_SIZE;
        packet.buf[offset..offset + payload.len()].copy_from_slice(payload);
        packet.received += 1;

        if index == count {
            packet.len = (count - 1) * MAX_PAYLOAD_SIZE + payload.len();
        }

        if packet.received == count {
            return Ok(pending.remove(&id));
        }

        Ok(None)
    }
}

impl Default for PacketManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::IdGen;
    use rand::RngCore;

    fn random_data(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_fragment_exact_multiple() {
        let manager = PacketManager::new();
        let gen = IdGen::seeded(11);

        let id = gen.request_id();
        let data = random_data(MAX_PAYLOAD_SIZE * 3);

        assert!(manager.needs_fragmenting(&data));

        let mut packet = manager.fragment(&id, &data).unwrap();
        assert_eq!(packet.fragments(), 3);

        for i in 0..3 {
            let frame = packet.next().unwrap();

            assert_eq!(&frame[..KEY_BYTES], &id);
            assert_eq!(frame[KEY_BYTES], (i + 1) as u8);
            assert_eq!(frame[KEY_BYTES + 1], 3);
            assert_eq!(
                &frame[PACKET_HEADER_SIZE..],
                &data[MAX_PAYLOAD_SIZE * i..MAX_PAYLOAD_SIZE * (i + 1)]
            );
        }

        assert!(packet.next().is_none());
        manager.release(packet);
    }

    #[test]
    fn test_fragment_short_tail() {
        let manager = PacketManager::new();
        let gen = IdGen::seeded(12);

        let id = gen.request_id();
        let data = random_data(MAX_PAYLOAD_SIZE * 3 - 300);

        let mut packet = manager.fragment(&id, &data).unwrap();
        assert_eq!(packet.fragments(), 3);

        let mut read = 0;
        while let Some(frame) = packet.next() {
            let payload = &frame[PACKET_HEADER_SIZE..];
            assert_eq!(payload, &data[read..read + payload.len()]);
            read += payload.len();
        }

        assert_eq!(read, data.len());
        manager.release(packet);
    }

    #[test]
    fn test_assemble_out_of_order() {
        let manager = PacketManager::new();
        let gen = IdGen::seeded(13);

        let id = gen.request_id();
        let data = random_data(MAX_PAYLOAD_SIZE * 5);

        let mut outgoing = manager.fragment(&id, &data).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = outgoing.next() {
            frames.push(frame.to_vec());
        }
        manager.release(outgoing);

        // deliver in reverse: nothing completes until the last slot fills
        for frame in frames.iter().skip(1).rev() {
            assert!(manager.assemble(frame).unwrap().is_none());
        }

        let packet = manager.assemble(&frames[0]).unwrap().unwrap();
        assert_eq!(packet.data(), &data[..]);
        manager.release(packet);
    }

    #[test]
    fn test_assemble_single_fragment() {
        let manager = PacketManager::new();
        let gen = IdGen::seeded(14);

        let id = gen.request_id();
        let data = random_data(MAX_PAYLOAD_SIZE / 2);

        assert!(!manager.needs_fragmenting(&data));

        let mut outgoing = manager.fragment(&id, &data).unwrap();
        let frame = outgoing.next().unwrap().to_vec();
        assert_eq!(frame.len(), data.len() + PACKET_HEADER_SIZE);
        assert!(outgoing.next().is_none());
        manager.release(outgoing);

        let packet = manager.assemble(&frame).unwrap().unwrap();
        assert_eq!(packet.data(), &data[..]);
        manager.release(packet);
    }

    #[test]
    fn test_assemble_duplicate_fragments() {
        let manager = PacketManager::new();
        let gen = IdGen::seeded(15);

        let id = gen.request_id();
        let data = random_data(MAX_PAYLOAD_SIZE * 2 + 77);

        let mut outgoing = manager.fragment(&id, &data).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = outgoing.next() {
            frames.push(frame.to_vec());
        }
        manager.release(outgoing);

        assert!(manager.assemble(&frames[0]).unwrap().is_none());
        // a replayed fragment changes nothing
        assert!(manager.assemble(&frames[0]).unwrap().is_none());
        assert!(manager.assemble(&frames[1]).unwrap().is_none());

        let packet = manager.assemble(&frames[2]).unwrap().unwrap();
        assert_eq!(packet.data(), &data[..]);
        manager.release(packet);
    }

    #[test]
    fn test_assemble_rejects_malformed() {
        let manager = PacketManager::new();

        // too short to carry a header
        assert!(manager.assemble(&[0u8; 10]).is_err());

        // zero fragment index
        let mut frame = vec![0u8; PACKET_HEADER_SIZE + 1];
        frame[KEY_BYTES] = 0;
        frame[KEY_BYTES + 1] = 1;
        assert!(manager.assemble(&frame).is_err());

        // index beyond count
        frame[KEY_BYTES] = 3;
        frame[KEY_BYTES + 1] = 2;
        assert!(manager.assemble(&frame).is_err());
    }

    #[test]
    fn test_fragment_too_large() {
        let manager = PacketManager::new();
        let gen = IdGen::seeded(16);

        let data = random_data(MAX_PAYLOAD_SIZE * MAX_FRAGMENTS + 1);
        assert!(manager.fragment(&gen.request_id(), &data).is_err());
    }

    #[test]
    fn test_pool_reuse() {
        let manager = PacketManager::new();
        let gen = IdGen::seeded(17);

        let first = manager.fragment(&gen.request_id(), b"hello").unwrap();
        manager.release(first);

        let id = gen.request_id();
        let data = random_data(100);
        let mut packet = manager.fragment(&id, &data).unwrap();

        let frame = packet.next().unwrap();
        assert_eq!(&frame[PACKET_HEADER_SIZE..], &data[..]);
        assert_eq!(packet.id(), &id);
    }
}
