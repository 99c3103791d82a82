//! Stateless pair-routed UDP media relay (spec §4.9) plus the media-silence
//! half of server-side connection-down detection (spec §4.7). One shared
//! `UdpSocket`, no per-call state beyond "who's the active partner" looked
//! up fresh from the registry on every datagram.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::time::interval;

use meshcall_core::wire::DatagramHeader;

use crate::server::SharedState;

const RECV_BUF_SIZE: usize = 2048;
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Tracks the last time a datagram (keepalive or media) arrived from each
/// known media endpoint, so the silence sweep can tell who's gone quiet
/// without touching the registry's own per-user bookkeeping.
#[derive(Default)]
struct LastSeen {
    seen: Mutex<HashMap<SocketAddr, Instant>>,
}

impl LastSeen {
    fn touch(&self, addr: SocketAddr, now: Instant) {
        self.seen.lock().insert(addr, now);
    }

    fn forget(&self, addr: &SocketAddr) {
        self.seen.lock().remove(addr);
    }

    fn stale_as_of(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        self.seen
            .lock()
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= timeout)
            .map(|(addr, _)| *addr)
            .collect()
    }
}

/// Runs forever, relaying datagrams between active-call partners and
/// sweeping for endpoints that have gone silent. Driven by
/// [`crate::server::Server::run`].
pub async fn run(socket: UdpSocket, state: Arc<SharedState>, silence_timeout: Duration) {
    let socket = Arc::new(socket);
    let last_seen = Arc::new(LastSeen::default());

    let sweeper = {
        let socket = socket.clone();
        let state = state.clone();
        let last_seen = last_seen.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                for addr in last_seen.stale_as_of(now, silence_timeout) {
                    let Some(hash) = state.registry.hash_for_media_addr(addr) else {
                        last_seen.forget(&addr);
                        continue;
                    };
                    last_seen.forget(&addr);
                    crate::server::mark_down_and_arm_grace(state.clone(), hash).await;
                }
                let _ = socket.as_ref();
            }
        })
    };

    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(error = %e, "media relay recv error");
                continue;
            }
        };
        let Ok(header) = DatagramHeader::decode(&buf[..len]) else { continue };

        if header.is_keepalive() {
            last_seen.touch(source, Instant::now());
            if header.packet_type == meshcall_core::wire::datagram::MEDIA_PACKET_TYPE_PING {
                let pong = DatagramHeader { packet_type: meshcall_core::wire::datagram::MEDIA_PACKET_TYPE_PONG, ..header };
                let _ = socket.send_to(&pong.encode(), source).await;
            }
            continue;
        }

        let Some(hash) = state.registry.hash_for_media_addr(source) else { continue };
        last_seen.touch(source, Instant::now());

        let Ok(partner) = state.registry.active_partner(&hash) else { continue };
        let Some(partner_addr) = state.registry.media_addr_for_hash(&partner.hash) else { continue };

        // Forwarded verbatim — the relay never reassembles or rewrites a
        // fragment, only routes the raw bytes to the other side of the call.
        let _ = socket.send_to(&buf[..len], partner_addr).await;
    }

    #[allow(unreachable_code)]
    {
        sweeper.abort();
    }
}
