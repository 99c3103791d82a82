//! Control channel framing: an 8-byte little-endian header followed by a
//! JSON body (spec §4.1).
//!
//! ```text
//! [packet_type: u32 LE][body_size: u32 LE][body: body_size bytes of JSON]
//! ```

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::WireError;
use crate::wire::packet::{ControlPacket, PacketType};

const HEADER_LEN: usize = 8;

/// Bodies larger than this are rejected rather than allocated for, so a
/// corrupt or hostile peer can't force an unbounded allocation.
pub const MAX_BODY_SIZE: u32 = 1 << 20;

pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    packet: &ControlPacket,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(&packet.body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&(packet.packet_type as u32).to_le_bytes());
    header[4..8].copy_from_slice(&(body.len() as u32).to_le_bytes());
    writer.write_all(&header).await?;
    writer.write_all(&body).await?;
    Ok(())
}

/// Read one frame from the control channel. Returns `Ok(None)` on a clean
/// EOF before any header bytes arrive (peer closed the connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<ControlPacket>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let type_raw = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let body_size = u32::from_le_bytes(header[4..8].try_into().unwrap());

    if body_size > MAX_BODY_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            WireError::BodyTooLarge(body_size),
        ));
    }
    let packet_type = PacketType::try_from(type_raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut body_bytes = vec![0u8; body_size as usize];
    reader.read_exact(&mut body_bytes).await?;
    let body = if body_bytes.is_empty() {
        crate::wire::packet::PacketBody::default()
    } else {
        serde_json::from_slice(&body_bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, WireError::from(e)))?
    };

    Ok(Some(ControlPacket { packet_type, body }))
}

/// The handshake scramble used to confirm both sides of a fresh TCP
/// connection speak the same protocol before any framed traffic crosses
/// the wire (spec §4.1, resolved against the original connection
/// handshake: generate a nonce, have the peer echo `scramble(nonce)`, then
/// echo `scramble(that)` back for final confirmation).
pub fn scramble(value: u64) -> u64 {
    let mut x = value;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Connecting-side half of the handshake: read the accepting side's nonce,
/// answer with `scramble(nonce)`, and check the echo back matches.
pub async fn handshake_as_connector<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut nonce_bytes = [0u8; 8];
    stream.read_exact(&mut nonce_bytes).await?;
    let response = scramble(u64::from_le_bytes(nonce_bytes));
    stream.write_all(&response.to_le_bytes()).await?;

    let mut echo_bytes = [0u8; 8];
    stream.read_exact(&mut echo_bytes).await?;
    if u64::from_le_bytes(echo_bytes) != response {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "handshake echo mismatch",
        ));
    }
    Ok(())
}

/// Accepting-side half of the handshake: send a random nonce, check the
/// peer answers with `scramble(nonce)`, then echo it back as confirmation.
pub async fn handshake_as_acceptor<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    use rand::RngCore;
    let nonce = rand::rngs::OsRng.next_u64();
    stream.write_all(&nonce.to_le_bytes()).await?;

    let mut response_bytes = [0u8; 8];
    stream.read_exact(&mut response_bytes).await?;
    let response = u64::from_le_bytes(response_bytes);
    if response != scramble(nonce) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "handshake response mismatch",
        ));
    }
    stream.write_all(&response.to_le_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::packet::PacketBody;

    #[tokio::test]
    async fn frame_roundtrip() {
        let packet = ControlPacket {
            packet_type: PacketType::Authorization,
            body: PacketBody {
                nickname_hash: Some("abc".into()),
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &packet).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.packet_type, PacketType::Authorization);
        assert_eq!(decoded.body.nickname_hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn clean_eof_before_header_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&(MAX_BODY_SIZE + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(header);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn scramble_is_deterministic_and_not_identity() {
        assert_eq!(scramble(42), scramble(42));
        assert_ne!(scramble(42), 42);
    }

    #[tokio::test]
    async fn handshake_succeeds_over_a_duplex_pipe() {
        let (mut client_side, mut server_side) = tokio::io::duplex(64);
        let (connector, acceptor) = tokio::join!(
            handshake_as_connector(&mut client_side),
            handshake_as_acceptor(&mut server_side)
        );
        connector.unwrap();
        acceptor.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_echo() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // `a` plays the accepting role but `b` answers with garbage instead
        // of scramble(nonce); the accepting side must reject it.
        let acceptor = tokio::spawn(async move { handshake_as_acceptor(&mut a).await });
        let mut nonce_bytes = [0u8; 8];
        b.read_exact(&mut nonce_bytes).await.unwrap();
        b.write_all(&99u64.to_le_bytes()).await.unwrap();
        assert!(acceptor.await.unwrap().is_err());
    }
}
