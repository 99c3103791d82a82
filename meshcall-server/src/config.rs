//! Server startup configuration (spec §6 "Network endpoints (server)").

use clap::Parser;

/// Both listen addresses are independently configurable; the defaults are
/// an implementation choice, not part of the protocol (spec §6).
#[derive(Parser, Debug, Clone)]
#[command(name = "meshcall-server", about = "MeshCall signalling and media relay server")]
pub struct ServerConfig {
    /// TCP control channel listen address.
    #[arg(long, default_value = "0.0.0.0:9000", env = "MESHCALL_CONTROL_ADDR")]
    pub control_addr: String,

    /// UDP media relay listen address.
    #[arg(long, default_value = "0.0.0.0:9001", env = "MESHCALL_MEDIA_ADDR")]
    pub media_addr: String,

    /// How long a media endpoint may stay silent before the server marks
    /// its connection down for every call partner (spec §4.7).
    #[arg(long, default_value = "6", env = "MESHCALL_SILENCE_TIMEOUT_SECS")]
    pub silence_timeout_secs: u64,

    /// How long a connection-down user has to RECONNECT before the server
    /// runs the full logout teardown on its behalf (spec §4.7, §4.8).
    #[arg(long, default_value = "120", env = "MESHCALL_DOWN_GRACE_SECS")]
    pub down_grace_secs: u64,
}
