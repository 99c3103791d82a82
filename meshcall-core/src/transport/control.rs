//! The reliable TCP control channel (spec §4.1): framed packets over a
//! connection confirmed live by the scramble handshake, with a keepalive
//! tuned so a silent failure surfaces within the connection-down window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::TcpKeepalive;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::wire::{handshake_as_connector, read_frame, write_frame, ControlPacket};

const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_RETRIES: u32 = 3;

/// Events the control transport reports back to whatever owns it.
#[derive(Debug)]
pub enum ControlEvent {
    Packet(ControlPacket),
    /// The connection died; fired at most once per connection.
    Down,
}

/// A live TCP control connection with its reader and writer split across
/// background tasks. Send packets through [`ControlTransport::send`];
/// receive them (and the down notification) from the channel returned by
/// [`ControlTransport::connect`]. Cheap to clone: every clone shares the
/// same writer queue and down flag, which lets the `TaskManager`'s retry
/// closures hold their own handle alongside the client actor's.
#[derive(Clone)]
pub struct ControlTransport {
    write_tx: mpsc::Sender<ControlPacket>,
    connected: Arc<AtomicBool>,
}

impl ControlTransport {
    /// Connect to `server_addr`, run the liveness handshake, apply TCP
    /// keepalive, and spawn the reader/writer tasks. Returns the transport
    /// handle plus the channel that carries incoming packets and the
    /// eventual down notification.
    pub async fn connect(server_addr: &str) -> std::io::Result<(Self, mpsc::UnboundedReceiver<ControlEvent>)> {
        let mut stream = TcpStream::connect(server_addr).await?;
        apply_keepalive(&stream)?;
        handshake_as_connector(&mut stream).await?;
        tracing::debug!(server_addr, "control channel handshake complete");

        let (read_half, write_half) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::channel(256);
        let connected = Arc::new(AtomicBool::new(true));

        spawn_reader(read_half, event_tx.clone(), connected.clone());
        spawn_writer(write_half, write_rx, event_tx, connected.clone());

        Ok((
            Self {
                write_tx,
                connected,
            },
            event_rx,
        ))
    }

    /// Queue a packet for the writer task. Fails silently into a dropped
    /// packet if the connection is already down; callers relying on a
    /// response should be driving the request through the task manager,
    /// which will simply retry and eventually time out.
    pub async fn send(&self, packet: ControlPacket) {
        let _ = self.write_tx.send(packet).await;
    }

    /// Non-blocking enqueue for callers that can't await, such as a
    /// `TaskManager` retry attempt closure. Drops the packet (rather than
    /// blocking) if the writer's queue is momentarily full; the retry
    /// interval covers for the loss.
    pub fn try_send(&self, packet: ControlPacket) -> bool {
        self.write_tx.try_send(packet).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

fn apply_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    #[cfg(target_os = "linux")]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    sock_ref.set_tcp_keepalive(&keepalive)
}

/// Marks the connection down and reports it, but only the first time any
/// task observes the failure; reader and writer tasks race to do this and
/// only one may win.
fn mark_down_once(connected: &Arc<AtomicBool>, event_tx: &mpsc::UnboundedSender<ControlEvent>) {
    if connected.swap(false, Ordering::AcqRel) {
        let _ = event_tx.send(ControlEvent::Down);
    }
}

fn spawn_reader(
    mut read_half: ReadHalf<TcpStream>,
    event_tx: mpsc::UnboundedSender<ControlEvent>,
    connected: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(packet)) => {
                    if event_tx.send(ControlEvent::Packet(packet)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("control channel closed by peer");
                    mark_down_once(&connected, &event_tx);
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "control channel read failed");
                    mark_down_once(&connected, &event_tx);
                    break;
                }
            }
        }
    });
}

fn spawn_writer(
    mut write_half: WriteHalf<TcpStream>,
    mut write_rx: mpsc::Receiver<ControlPacket>,
    event_tx: mpsc::UnboundedSender<ControlEvent>,
    connected: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        while let Some(packet) = write_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &packet).await {
                tracing::warn!(error = %e, "control channel write failed");
                mark_down_once(&connected, &event_tx);
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{PacketBody, PacketType};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_runs_handshake_and_exchanges_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            crate::wire::handshake_as_acceptor(&mut stream).await.unwrap();
            let (mut read_half, mut write_half) = tokio::io::split(stream);
            let packet = read_frame(&mut read_half).await.unwrap().unwrap();
            assert_eq!(packet.packet_type, PacketType::Authorization);
            write_frame(
                &mut write_half,
                &ControlPacket::new(
                    PacketType::AuthorizationResult,
                    PacketBody {
                        result: Some(crate::error::ErrorCode::Success),
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap();
        });

        let (transport, mut events) = ControlTransport::connect(&addr.to_string()).await.unwrap();
        transport
            .send(ControlPacket::new(PacketType::Authorization, PacketBody::default()))
            .await;

        let event = events.recv().await.unwrap();
        match event {
            ControlEvent::Packet(p) => assert_eq!(p.packet_type, PacketType::AuthorizationResult),
            ControlEvent::Down => panic!("unexpected down event"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_drop_reports_down_exactly_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            crate::wire::handshake_as_acceptor(&mut stream).await.unwrap();
            drop(stream);
        });

        let (_transport, mut events) = ControlTransport::connect(&addr.to_string()).await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, ControlEvent::Down));
    }
}
