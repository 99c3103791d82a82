//! Client core and shared wire protocol for the MeshCall peer-to-peer
//! calling platform (spec.md §1-§9).
//!
//! `meshcall-server` depends on this crate for [`wire`] and [`crypto`];
//! everything else here is the client side: the state machine ([`state`]),
//! the signalling packet builders and precondition checks ([`signalling`]),
//! the transports ([`transport`]), the retry engine ([`task_manager`]),
//! reassembly ([`reassembly`]), media encrypt/decrypt ([`media_ops`]), the
//! reconnect loop ([`reconnect`]), and the [`client::Client`] facade that
//! wires all of the above into one actor task.

pub mod client;
pub mod collaborators;
pub mod crypto;
pub mod error;
pub mod event;
pub mod media_ops;
pub mod reassembly;
pub mod reconnect;
pub mod signalling;
pub mod state;
pub mod task_manager;
pub mod transport;
pub mod wire;

pub use error::ErrorCode;
pub use event::Event;
