//! Collaborator interfaces the core consumes but never implements (spec
//! §1 "deliberately OUT of scope", §6 "Collaborator interfaces").
//!
//! Codec plumbing, capture devices, and crypto primitives all sit behind
//! these seams so the core stays a pure signalling/relay/transport engine.
//! `CryptoSurface` is a set of free functions in [`crate::crypto`] rather
//! than a trait — MeshCall picks one concrete primitive stack (spec §9
//! Open Questions) instead of leaving it pluggable, since nothing in the
//! pack swaps crypto backends at runtime.

/// Capture/playback device for the voice stream. The core calls
/// [`AudioEngine::on_remote_frame`] with each decrypted frame from the
/// peer; it never calls `start`/`stop` itself — those are for the
/// application to drive from its own UI state.
pub trait AudioEngine: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn set_muted(&self, muted: bool);
    fn set_volume(&self, volume: f32);
    /// A decrypted voice frame from the remote peer, ready for playback.
    /// Unlike screen/camera frames this never crosses the [`crate::event::Event`]
    /// channel — voice playback is latency-sensitive and the application
    /// is expected to hand this straight to its audio output.
    fn on_remote_frame(&self, frame: &[u8]);
}
