//! meshcall-server: the dispatcher, registry, and pair-routed media relay
//! described in spec §2.9-§2.11, §4.7, §4.9.

pub mod config;
pub mod connection;
pub mod registry;
pub mod relay;
pub mod server;
