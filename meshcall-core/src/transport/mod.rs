//! Dual-transport network substrate (spec §4): a reliable length-framed
//! TCP control channel and an unreliable, fragmented UDP media channel.

pub mod control;
pub mod media;

pub use control::{ControlEvent, ControlTransport};
pub use media::MediaTransport;
