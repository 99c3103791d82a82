//! The unreliable UDP media channel (spec §4.2): fragmented datagrams sent
//! fire-and-forget to the server's media relay, with a periodic keepalive
//! so the relay (and any NAT in between) keeps the path open.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::reassembly::Reassembler;
use crate::wire::datagram::{fragment, DatagramHeader, MEDIA_PACKET_TYPE_PING, MEDIA_PACKET_TYPE_PONG};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// A reassembled media payload delivered to the owner of this transport.
#[derive(Debug, Clone)]
pub struct MediaDatagram {
    pub packet_type: u32,
    pub payload: Vec<u8>,
}

/// The client side of the UDP media channel: one fixed remote address (the
/// relay), an outgoing fragmenter, and a background task reassembling and
/// forwarding whatever arrives from that address.
pub struct MediaTransport {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    next_packet_id: AtomicU64,
}

impl MediaTransport {
    /// Bind an ephemeral local UDP port and start exchanging datagrams with
    /// `server_addr`. Returns the transport plus the channel that carries
    /// reassembled, non-keepalive datagrams.
    pub async fn bind(server_addr: SocketAddr) -> std::io::Result<(Self, mpsc::UnboundedReceiver<MediaDatagram>)> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.connect(server_addr).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_recv_loop(socket.clone(), server_addr, tx);
        spawn_keepalive(socket.clone());

        Ok((
            Self {
                socket,
                server_addr,
                next_packet_id: AtomicU64::new(1),
            },
            rx,
        ))
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Fragment and send `payload` fire-and-forget; media is best-effort
    /// and the spec never retries a dropped frame.
    pub fn send(&self, packet_type: u32, payload: Vec<u8>) {
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let socket = self.socket.clone();
        tokio::spawn(async move {
            for (header, chunk) in fragment(packet_id, packet_type, &payload) {
                let mut datagram = Vec::with_capacity(crate::wire::datagram::DATAGRAM_HEADER_LEN + chunk.len());
                datagram.extend_from_slice(&header.encode());
                datagram.extend_from_slice(chunk);
                if let Err(e) = socket.send(&datagram).await {
                    tracing::debug!(error = %e, "media send failed");
                    break;
                }
            }
        });
    }
}

fn spawn_keepalive(socket: Arc<UdpSocket>) {
    tokio::spawn(async move {
        let mut ticker = interval(KEEPALIVE_INTERVAL);
        loop {
            ticker.tick().await;
            let header = DatagramHeader {
                packet_id: 0,
                chunk_index: 0,
                total_chunks: 1,
                payload_len: 0,
                packet_type: MEDIA_PACKET_TYPE_PING,
            };
            let _ = socket.send(&header.encode()).await;
        }
    });
}

fn spawn_recv_loop(socket: Arc<UdpSocket>, server_addr: SocketAddr, tx: mpsc::UnboundedSender<MediaDatagram>) {
    tokio::spawn(async move {
        let mut reassembler: Reassembler<SocketAddr> = Reassembler::new();
        let mut sweeper = interval(SWEEP_INTERVAL);
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = sweeper.tick() => {
                    reassembler.sweep();
                }
                result = socket.recv_from(&mut buf) => {
                    let Ok((len, source)) = result else { break };
                    if source != server_addr {
                        continue;
                    }
                    let Ok(header) = DatagramHeader::decode(&buf[..len]) else { continue };
                    if header.is_keepalive() {
                        if header.packet_type == MEDIA_PACKET_TYPE_PING {
                            let pong = DatagramHeader {
                                packet_type: MEDIA_PACKET_TYPE_PONG,
                                ..header
                            };
                            let _ = socket.send(&pong.encode()).await;
                        }
                        continue;
                    }
                    let chunk = &buf[crate::wire::datagram::DATAGRAM_HEADER_LEN..len];
                    if let Some((packet_type, payload)) = reassembler.accept(source, header, chunk) {
                        if tx.send(MediaDatagram { packet_type, payload }).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_and_receive_roundtrip() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();

        let (client, mut client_rx) = MediaTransport::bind(server_addr).await.unwrap();
        client.send(100, vec![42u8; 10]);

        let mut buf = vec![0u8; 2048];
        let (len, client_addr) = server_socket.recv_from(&mut buf).await.unwrap();
        server_socket.send_to(&buf[..len], client_addr).await.unwrap();

        let datagram = client_rx.recv().await.unwrap();
        assert_eq!(datagram.packet_type, 100);
        assert_eq!(datagram.payload, vec![42u8; 10]);
    }
}
