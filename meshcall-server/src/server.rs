//! Server state and listener orchestration (spec §2.9-§2.11, §6 "Network
//! endpoints (server)"): one TCP listener for the control channel, one UDP
//! socket for the media relay, both bound at [`Server::run`] and driven
//! forever — grounded on `freeq-server/src/server.rs`'s `Server::run`
//! (bind-then-spawn-accept-loop shape), trimmed of everything this
//! protocol has no counterpart for (TLS, federation, web/WS, plugins).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, UdpSocket};

use crate::config::ServerConfig;
use crate::registry::Registry;

/// Everything a connection handler or the media relay needs, shared behind
/// an `Arc` (spec §5 "one coarse mutex per aggregate" — the mutex lives
/// inside [`Registry`] itself, `SharedState` just carries the config values
/// handlers need alongside it).
pub struct SharedState {
    pub registry: Registry,
    pub down_grace: Duration,
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let state = Arc::new(SharedState {
            registry: Registry::new(),
            down_grace: Duration::from_secs(self.config.down_grace_secs),
        });

        let control_listener = TcpListener::bind(&self.config.control_addr).await?;
        tracing::info!(addr = %self.config.control_addr, "control listener up");

        let media_socket = UdpSocket::bind(&self.config.media_addr).await?;
        tracing::info!(addr = %self.config.media_addr, "media relay listener up");

        let silence_timeout = Duration::from_secs(self.config.silence_timeout_secs);
        let relay_state = state.clone();
        tokio::spawn(async move {
            crate::relay::run(media_socket, relay_state, silence_timeout).await;
        });

        loop {
            let (stream, peer_addr) = match control_listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "control accept error");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            tracing::debug!(peer = %peer_addr, "control connection accepted");
            let state = state.clone();
            tokio::spawn(async move {
                crate::connection::handle(stream, state).await;
            });
        }
    }
}

/// Shared by the media-silence sweep (spec §4.7 "Connection-down on
/// server") and a dying control connection noticing its own read loop
/// ended: flag the user down, fan the notification out to every
/// pending/active counterparty, then arm the ~2 min grace-period timer
/// that runs the full logout teardown if nobody reconnects in time.
pub async fn mark_down_and_arm_grace(state: Arc<SharedState>, nickname_hash: String) {
    let Some((down_token, notifies)) = state.registry.mark_connection_down(&nickname_hash) else {
        return;
    };
    for notify in notifies {
        let _ = notify.tx.send(notify.packet).await;
    }

    let grace = state.down_grace;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let notifies = state.registry.expire_down_grace_period(&nickname_hash, down_token);
        for notify in notifies {
            let _ = notify.tx.send(notify.packet).await;
        }
    });
}
