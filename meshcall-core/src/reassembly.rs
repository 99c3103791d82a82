//! Datagram reassembly shared by the client media transport and the
//! server's media relay (spec §4.2).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::wire::datagram::DatagramHeader;

const MAX_PENDING_PER_ENDPOINT: usize = 64;
const PENDING_TTL: Duration = Duration::from_secs(5);

struct PendingPacket {
    total_chunks: u16,
    packet_type: u32,
    chunks: Vec<Option<Vec<u8>>>,
    received: u16,
    last_update: Instant,
}

impl PendingPacket {
    fn new(total_chunks: u16, packet_type: u32) -> Self {
        Self {
            total_chunks,
            packet_type,
            chunks: vec![None; total_chunks as usize],
            received: 0,
            last_update: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.total_chunks
    }

    fn concat(&self) -> Vec<u8> {
        self.chunks
            .iter()
            .flatten()
            .flat_map(|c| c.iter().copied())
            .collect()
    }
}

/// Per-endpoint reassembly state. `E` is whatever the caller uses to
/// identify a source (a `SocketAddr` for both client and server).
pub struct Reassembler<E> {
    pending: HashMap<E, HashMap<u64, PendingPacket>>,
}

impl<E: Eq + Hash + Clone> Default for Reassembler<E> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<E: Eq + Hash + Clone> Reassembler<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the reassembled `(packet_type, payload)` once
    /// every chunk for its `packet_id` has arrived. A chunk that arrives
    /// with a `total_chunks`/`packet_type` mismatching a pending entry for
    /// the same id restarts reassembly for that id (the old packet_id was
    /// either reused early or corrupted in transit).
    pub fn accept(&mut self, source: E, header: DatagramHeader, chunk: &[u8]) -> Option<(u32, Vec<u8>)> {
        let per_source = self.pending.entry(source).or_default();

        let needs_reset = per_source
            .get(&header.packet_id)
            .map(|p| p.total_chunks != header.total_chunks || p.packet_type != header.packet_type)
            .unwrap_or(false);
        if needs_reset {
            per_source.remove(&header.packet_id);
        }

        if !per_source.contains_key(&header.packet_id) {
            if per_source.len() >= MAX_PENDING_PER_ENDPOINT {
                if let Some(oldest_id) = per_source
                    .iter()
                    .min_by_key(|(_, p)| p.last_update)
                    .map(|(id, _)| *id)
                {
                    per_source.remove(&oldest_id);
                }
            }
            per_source.insert(
                header.packet_id,
                PendingPacket::new(header.total_chunks, header.packet_type),
            );
        }

        let entry = per_source.get_mut(&header.packet_id).expect("just inserted");
        let idx = header.chunk_index as usize;
        if idx < entry.chunks.len() && entry.chunks[idx].is_none() {
            entry.chunks[idx] = Some(chunk.to_vec());
            entry.received += 1;
        }
        entry.last_update = Instant::now();

        if entry.is_complete() {
            let packet_type = entry.packet_type;
            let payload = entry.concat();
            per_source.remove(&header.packet_id);
            Some((packet_type, payload))
        } else {
            None
        }
    }

    /// Drop entries untouched for longer than the pending-packet TTL, and
    /// the per-source map itself once it is empty.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.pending.retain(|_, per_source| {
            per_source.retain(|_, p| now.duration_since(p.last_update) < PENDING_TTL);
            !per_source.is_empty()
        });
    }

    pub fn pending_count(&self, source: &E) -> usize {
        self.pending.get(source).map_or(0, |m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::datagram::fragment;

    #[test]
    fn reassembles_a_fragmented_packet_in_order() {
        let payload = vec![7u8; 3000];
        let fragments = fragment(1, 100, &payload);
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for (header, chunk) in &fragments {
            result = reassembler.accept("peer", *header, chunk);
        }
        let (packet_type, got) = result.expect("should complete on last chunk");
        assert_eq!(packet_type, 100);
        assert_eq!(got, payload);
    }

    #[test]
    fn reassembles_out_of_order_chunks() {
        let payload = vec![9u8; 4000];
        let mut fragments = fragment(2, 100, &payload);
        fragments.reverse();
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for (header, chunk) in &fragments {
            result = reassembler.accept("peer", *header, chunk);
        }
        let (_, got) = result.expect("should complete once all arrive, any order");
        assert_eq!(got, payload);
    }

    #[test]
    fn distinct_packet_ids_do_not_interfere() {
        let payload_a = vec![1u8; 10];
        let payload_b = vec![2u8; 10];
        let mut reassembler = Reassembler::new();
        let frags_a = fragment(1, 100, &payload_a);
        let frags_b = fragment(2, 100, &payload_b);
        for (header, chunk) in &frags_a {
            reassembler.accept("peer", *header, chunk);
        }
        let mut result = None;
        for (header, chunk) in &frags_b {
            result = reassembler.accept("peer", *header, chunk);
        }
        assert_eq!(result.unwrap().1, payload_b);
    }

    #[test]
    fn eviction_bounds_memory_per_endpoint() {
        let mut reassembler = Reassembler::new();
        for packet_id in 0..(MAX_PENDING_PER_ENDPOINT as u64 + 10) {
            let header = DatagramHeader {
                packet_id,
                chunk_index: 0,
                total_chunks: 2,
                payload_len: 1,
                packet_type: 100,
            };
            reassembler.accept("peer", header, &[0u8]);
        }
        assert!(reassembler.pending_count(&"peer") <= MAX_PENDING_PER_ENDPOINT);
    }

    #[test]
    fn sweep_drops_stale_entries() {
        let mut reassembler = Reassembler::new();
        let header = DatagramHeader {
            packet_id: 1,
            chunk_index: 0,
            total_chunks: 2,
            payload_len: 1,
            packet_type: 100,
        };
        reassembler.accept("peer", header, &[0u8]);
        assert_eq!(reassembler.pending_count(&"peer"), 1);

        if let Some(per_source) = reassembler.pending.get_mut("peer") {
            for p in per_source.values_mut() {
                p.last_update = Instant::now() - Duration::from_secs(10);
            }
        }
        reassembler.sweep();
        assert_eq!(reassembler.pending_count(&"peer"), 0);
    }
}
