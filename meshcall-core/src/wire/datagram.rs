//! Media channel datagram header (spec §4.2): a fixed 18-byte big-endian
//! header followed by the fragment payload.
//!
//! ```text
//! [packet_id: u64][chunk_index: u16][total_chunks: u16][payload_len: u16][packet_type: u32]
//! ```
//!
//! Packet types 0 and 1 are reserved for the UDP keepalive ping/pong and
//! are consumed by the transport layer; they never reach the reassembly
//! map or the application.

use crate::error::WireError;

pub const DATAGRAM_HEADER_LEN: usize = 18;

pub const MEDIA_PACKET_TYPE_PING: u32 = 0;
pub const MEDIA_PACKET_TYPE_PONG: u32 = 1;

/// Chunks larger than this are rejected by the fragmenter; it keeps
/// datagrams comfortably under typical path MTUs.
pub const MAX_CHUNK_PAYLOAD: usize = 1300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub packet_id: u64,
    pub chunk_index: u16,
    pub total_chunks: u16,
    pub payload_len: u16,
    pub packet_type: u32,
}

impl DatagramHeader {
    pub fn encode(&self) -> [u8; DATAGRAM_HEADER_LEN] {
        let mut buf = [0u8; DATAGRAM_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.packet_id.to_be_bytes());
        buf[8..10].copy_from_slice(&self.chunk_index.to_be_bytes());
        buf[10..12].copy_from_slice(&self.total_chunks.to_be_bytes());
        buf[12..14].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[14..18].copy_from_slice(&self.packet_type.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < DATAGRAM_HEADER_LEN {
            return Err(WireError::DatagramTooShort);
        }
        Ok(Self {
            packet_id: u64::from_be_bytes(bytes[0..8].try_into().unwrap()),
            chunk_index: u16::from_be_bytes(bytes[8..10].try_into().unwrap()),
            total_chunks: u16::from_be_bytes(bytes[10..12].try_into().unwrap()),
            payload_len: u16::from_be_bytes(bytes[12..14].try_into().unwrap()),
            packet_type: u32::from_be_bytes(bytes[14..18].try_into().unwrap()),
        })
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(
            self.packet_type,
            MEDIA_PACKET_TYPE_PING | MEDIA_PACKET_TYPE_PONG
        )
    }
}

/// Split `payload` into `(header, chunk_bytes)` pairs, each within
/// [`MAX_CHUNK_PAYLOAD`]. `payload` may be empty (keepalive datagrams
/// carry a single zero-length chunk).
pub fn fragment(packet_id: u64, packet_type: u32, payload: &[u8]) -> Vec<(DatagramHeader, &[u8])> {
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        vec![&payload[0..0]]
    } else {
        payload.chunks(MAX_CHUNK_PAYLOAD).collect()
    };
    let total_chunks = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let header = DatagramHeader {
                packet_id,
                chunk_index: i as u16,
                total_chunks,
                payload_len: chunk.len() as u16,
                packet_type,
            };
            (header, chunk)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = DatagramHeader {
            packet_id: 0x0102030405060708,
            chunk_index: 3,
            total_chunks: 7,
            payload_len: 42,
            packet_type: 10,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), DATAGRAM_HEADER_LEN);
        let decoded = DatagramHeader::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(DatagramHeader::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn fragment_splits_at_max_chunk_size() {
        let payload = vec![7u8; MAX_CHUNK_PAYLOAD * 2 + 10];
        let chunks = fragment(1, 20, &payload);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].0.total_chunks, 3);
        assert_eq!(chunks[2].1.len(), 10);
    }

    #[test]
    fn keepalive_types_detected() {
        let mut header = DatagramHeader {
            packet_id: 0,
            chunk_index: 0,
            total_chunks: 1,
            payload_len: 0,
            packet_type: MEDIA_PACKET_TYPE_PING,
        };
        assert!(header.is_keepalive());
        header.packet_type = 20;
        assert!(!header.is_keepalive());
    }
}
