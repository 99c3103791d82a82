//! Encrypt-and-send / receive-and-decrypt media frames over the call key
//! (spec §2.8, §4.9 flow, §7 "decryption failures on media ... logged and
//! dropped").

use crate::crypto::{self, SymmetricKey};
use crate::wire::{MEDIA_TYPE_CAMERA, MEDIA_TYPE_SCREEN, MEDIA_TYPE_VOICE};

/// Which media stream a frame belongs to; maps directly onto the
/// datagram-layer packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Voice,
    Screen,
    Camera,
}

impl MediaKind {
    pub fn packet_type(self) -> u32 {
        match self {
            MediaKind::Voice => MEDIA_TYPE_VOICE,
            MediaKind::Screen => MEDIA_TYPE_SCREEN,
            MediaKind::Camera => MEDIA_TYPE_CAMERA,
        }
    }

    pub fn from_packet_type(packet_type: u32) -> Option<Self> {
        match packet_type {
            MEDIA_TYPE_VOICE => Some(MediaKind::Voice),
            MEDIA_TYPE_SCREEN => Some(MediaKind::Screen),
            MEDIA_TYPE_CAMERA => Some(MediaKind::Camera),
            _ => None,
        }
    }
}

/// Encrypt a captured frame under the active call's key, ready to hand to
/// [`crate::transport::media::MediaTransport::send`].
pub fn encrypt_frame(call_key: &SymmetricKey, plaintext: &[u8]) -> Option<Vec<u8>> {
    match crypto::encrypt_symmetric(call_key, plaintext) {
        Ok(wire) => Some(wire),
        Err(e) => {
            tracing::warn!(error = %e, "dropping outgoing media frame: encryption failed");
            None
        }
    }
}

/// Decrypt a reassembled frame from the remote peer. Returns `None` (and
/// logs) on any authentication failure instead of surfacing an error —
/// media is best-effort and a bad frame is simply dropped.
pub fn decrypt_frame(call_key: &SymmetricKey, wire: &[u8]) -> Option<Vec<u8>> {
    match crypto::decrypt_symmetric(call_key, wire) {
        Ok(plaintext) => Some(plaintext),
        Err(e) => {
            tracing::debug!(error = %e, "dropping incoming media frame: decryption failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let key = SymmetricKey::generate();
        let wire = encrypt_frame(&key, b"opus frame bytes").unwrap();
        let plaintext = decrypt_frame(&key, &wire).unwrap();
        assert_eq!(plaintext, b"opus frame bytes");
    }

    #[test]
    fn decrypt_with_wrong_key_is_dropped_not_panicked() {
        let key_a = SymmetricKey::generate();
        let key_b = SymmetricKey::generate();
        let wire = encrypt_frame(&key_a, b"frame").unwrap();
        assert!(decrypt_frame(&key_b, &wire).is_none());
    }

    #[test]
    fn media_kind_packet_type_roundtrips() {
        for kind in [MediaKind::Voice, MediaKind::Screen, MediaKind::Camera] {
            assert_eq!(MediaKind::from_packet_type(kind.packet_type()), Some(kind));
        }
    }
}
