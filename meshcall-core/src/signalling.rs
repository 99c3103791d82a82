//! Client-side signalling operations (spec §4.6): a synchronous
//! precondition check per operation plus a stateless packet builder. The
//! functions here never touch the network or the task manager directly —
//! `client.rs` calls a check, and on success hands the built packet to the
//! task manager over the control transport.

use x25519_dalek::PublicKey;

use crate::crypto::{self, SymmetricKey};
use crate::error::{CryptoError, ErrorCode};
use crate::state::{ClientState, ConnectionState, SharingState};
use crate::wire::{ControlPacket, PacketBody, PacketType};

/// Pending-call and reconnect timing constants (spec §4.5, §4.8).
pub const PENDING_CALL_TIMEOUT_SECS: u64 = 32;
pub const RECONNECT_RETRY_INTERVAL_SECS: u64 = 2;
pub const TASK_RETRY_INTERVAL_MS: u64 = 1500;
pub const TASK_MAX_ATTEMPTS: u32 = 3;

fn crypto_err(_: CryptoError) -> ErrorCode {
    ErrorCode::EncryptionError
}

// ---- authorize ----

pub fn check_authorize(state: &ClientState) -> Result<(), ErrorCode> {
    match state.connection {
        ConnectionState::Unauthorized => Ok(()),
        ConnectionState::Authorizing => Err(ErrorCode::OperationInProgress),
        ConnectionState::Authorized(_) => Err(ErrorCode::AlreadyAuthorized),
        ConnectionState::Reconnecting => Err(ErrorCode::ConnectionDown),
    }
}

pub fn build_authorization_packet(
    uid: &str,
    nickname_hash: &str,
    public_key: &PublicKey,
    udp_port: u16,
) -> ControlPacket {
    ControlPacket::new(
        PacketType::Authorization,
        PacketBody {
            uid: Some(uid.to_string()),
            nickname_hash: Some(nickname_hash.to_string()),
            public_key: Some(crypto::serialize_public_key(public_key)),
            udp_port: Some(udp_port),
            ..Default::default()
        },
    )
}

// ---- logout ----

pub fn check_logout(state: &ClientState) -> Result<(), ErrorCode> {
    if state.is_authorized() {
        Ok(())
    } else {
        Err(ErrorCode::NotAuthorized)
    }
}

pub fn build_logout_packet(uid: &str, token: &str) -> ControlPacket {
    ControlPacket::new(
        PacketType::Logout,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            ..Default::default()
        },
    )
}

// ---- reconnect ----

pub fn build_reconnect_packet(uid: &str, token: &str, udp_port: u16) -> ControlPacket {
    ControlPacket::new(
        PacketType::Reconnect,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            udp_port: Some(udp_port),
            ..Default::default()
        },
    )
}

// ---- get user info (first leg of startOutgoingCall's offer chain) ----

pub fn build_get_user_info_packet(uid: &str, token: &str, nickname_hash: &str) -> ControlPacket {
    ControlPacket::new(
        PacketType::GetUserInfo,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            nickname_hash: Some(nickname_hash.to_string()),
            ..Default::default()
        },
    )
}

// ---- start outgoing call ----

pub fn check_start_outgoing_call(state: &ClientState) -> Result<(), ErrorCode> {
    if !state.is_authorized() {
        return Err(ErrorCode::NotAuthorized);
    }
    if state.has_active_call() {
        return Err(ErrorCode::ActiveCallExists);
    }
    if state.has_outgoing_call() {
        return Err(ErrorCode::OperationInProgress);
    }
    Ok(())
}

/// Build the CALLING_BEGIN offer. `call_key` and `packet_key` are freshly
/// generated by the caller (spec §3 "Call keys"): both travel wrapped
/// under the callee's public key, and the caller's nickname is encrypted
/// under `packet_key` so the plaintext nickname never crosses the wire.
#[allow(clippy::too_many_arguments)]
pub fn build_calling_begin_packet(
    uid: &str,
    token: &str,
    sender_hash: &str,
    receiver_hash: &str,
    our_public_key: &PublicKey,
    our_nickname: &str,
    callee_public_key: &PublicKey,
    call_key: &SymmetricKey,
    packet_key: &SymmetricKey,
    udp_port: u16,
) -> Result<ControlPacket, ErrorCode> {
    let encrypted_call_key =
        crypto::wrap_symmetric_key(callee_public_key, call_key).map_err(crypto_err)?;
    let wrapped_packet_key =
        crypto::wrap_symmetric_key(callee_public_key, packet_key).map_err(crypto_err)?;
    let sender_encrypted_nickname =
        crypto::encrypt_symmetric_str(packet_key, our_nickname).map_err(crypto_err)?;
    Ok(ControlPacket::new(
        PacketType::CallingBegin,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            sender_hash: Some(sender_hash.to_string()),
            receiver_hash: Some(receiver_hash.to_string()),
            sender_public_key: Some(crypto::serialize_public_key(our_public_key)),
            encrypted_call_key: Some(encrypted_call_key),
            packet_key: Some(wrapped_packet_key),
            sender_encrypted_nickname: Some(sender_encrypted_nickname),
            udp_port: Some(udp_port),
            ..Default::default()
        },
    ))
}

/// Decode a received CALLING_BEGIN body into the caller's public key, the
/// agreed call key, and the caller's nickname, verifying the packet_key
/// wrap and the nickname ciphertext in the process.
pub fn decode_calling_begin(
    body: &PacketBody,
    our_keypair: &crate::crypto::KeyPair,
) -> Result<(PublicKey, SymmetricKey, String), ErrorCode> {
    let sender_public_key = body
        .sender_public_key
        .as_deref()
        .ok_or(ErrorCode::EncryptionError)?;
    let peer_public_key =
        crypto::deserialize_public_key(sender_public_key).map_err(crypto_err)?;

    let wrapped_call_key = body
        .encrypted_call_key
        .as_deref()
        .ok_or(ErrorCode::EncryptionError)?;
    let call_key =
        crypto::unwrap_symmetric_key(our_keypair, wrapped_call_key).map_err(crypto_err)?;

    let wrapped_packet_key = body.packet_key.as_deref().ok_or(ErrorCode::EncryptionError)?;
    let packet_key =
        crypto::unwrap_symmetric_key(our_keypair, wrapped_packet_key).map_err(crypto_err)?;

    let encrypted_nickname = body
        .sender_encrypted_nickname
        .as_deref()
        .ok_or(ErrorCode::EncryptionError)?;
    let nickname =
        crypto::decrypt_symmetric_str(&packet_key, encrypted_nickname).map_err(crypto_err)?;

    Ok((peer_public_key, call_key, nickname))
}

// ---- stop outgoing call ----

pub fn check_stop_outgoing_call(state: &ClientState) -> Result<(), ErrorCode> {
    if !state.is_authorized() {
        return Err(ErrorCode::NotAuthorized);
    }
    if !state.has_outgoing_call() {
        return Err(ErrorCode::NoOutgoingCall);
    }
    Ok(())
}

pub fn build_calling_end_packet(uid: &str, token: &str, receiver_hash: &str) -> ControlPacket {
    ControlPacket::new(
        PacketType::CallingEnd,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            receiver_hash: Some(receiver_hash.to_string()),
            ..Default::default()
        },
    )
}

// ---- accept call ----

pub fn check_accept_call(state: &ClientState, peer_hash: &str) -> Result<(), ErrorCode> {
    if !state.is_authorized() {
        return Err(ErrorCode::NotAuthorized);
    }
    if state.accept_in_flight {
        return Err(ErrorCode::OperationInProgress);
    }
    if !state.incoming_calls.contains_key(peer_hash) {
        return Err(ErrorCode::NoIncomingCall);
    }
    Ok(())
}

/// Re-wrap the already-agreed call key under the caller's public key, so
/// the caller recovers it even if its own copy was lost (spec §3).
pub fn build_call_accept_packet(
    uid: &str,
    token: &str,
    sender_hash: &str,
    receiver_hash: &str,
    caller_public_key: &PublicKey,
    call_key: &SymmetricKey,
) -> Result<ControlPacket, ErrorCode> {
    let encrypted_call_key =
        crypto::wrap_symmetric_key(caller_public_key, call_key).map_err(crypto_err)?;
    Ok(ControlPacket::new(
        PacketType::CallAccept,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            sender_hash: Some(sender_hash.to_string()),
            receiver_hash: Some(receiver_hash.to_string()),
            encrypted_call_key: Some(encrypted_call_key),
            ..Default::default()
        },
    ))
}

// ---- decline call ----

pub fn check_decline_call(state: &ClientState, peer_hash: &str) -> Result<(), ErrorCode> {
    if !state.is_authorized() {
        return Err(ErrorCode::NotAuthorized);
    }
    if !state.incoming_calls.contains_key(peer_hash) {
        return Err(ErrorCode::NoIncomingCall);
    }
    Ok(())
}

pub fn build_call_decline_packet(uid: &str, token: &str, receiver_hash: &str) -> ControlPacket {
    ControlPacket::new(
        PacketType::CallDecline,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            receiver_hash: Some(receiver_hash.to_string()),
            ..Default::default()
        },
    )
}

// ---- end call ----

pub fn check_end_call(state: &ClientState) -> Result<(), ErrorCode> {
    if !state.is_authorized() {
        return Err(ErrorCode::NotAuthorized);
    }
    if !state.has_active_call() {
        return Err(ErrorCode::NoActiveCall);
    }
    Ok(())
}

pub fn build_call_end_packet(uid: &str, token: &str, receiver_hash: &str) -> ControlPacket {
    ControlPacket::new(
        PacketType::CallEnd,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            receiver_hash: Some(receiver_hash.to_string()),
            ..Default::default()
        },
    )
}

// ---- sharing (screen/camera) ----

pub fn check_start_sharing(state: &ClientState, current: SharingState) -> Result<(), ErrorCode> {
    if !state.is_authorized() {
        return Err(ErrorCode::NotAuthorized);
    }
    if !state.has_active_call() {
        return Err(ErrorCode::NoActiveCall);
    }
    if state.viewing_remote_screen {
        return Err(ErrorCode::ViewingRemoteScreen);
    }
    if current != SharingState::Stopped {
        return Err(ErrorCode::ScreenSharingAlreadyActive);
    }
    Ok(())
}

pub fn check_start_camera_sharing(state: &ClientState, current: SharingState) -> Result<(), ErrorCode> {
    if !state.is_authorized() {
        return Err(ErrorCode::NotAuthorized);
    }
    if !state.has_active_call() {
        return Err(ErrorCode::NoActiveCall);
    }
    if current != SharingState::Stopped {
        return Err(ErrorCode::CameraSharingAlreadyActive);
    }
    Ok(())
}

pub fn check_stop_sharing(
    state: &ClientState,
    current: SharingState,
    not_active: ErrorCode,
) -> Result<(), ErrorCode> {
    if !state.is_authorized() {
        return Err(ErrorCode::NotAuthorized);
    }
    if !state.has_active_call() {
        return Err(ErrorCode::NoActiveCall);
    }
    if current == SharingState::Stopped {
        return Err(not_active);
    }
    Ok(())
}

pub fn build_screen_sharing_begin_packet(uid: &str, token: &str, receiver_hash: &str) -> ControlPacket {
    ControlPacket::new(
        PacketType::ScreenSharingBegin,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            receiver_hash: Some(receiver_hash.to_string()),
            ..Default::default()
        },
    )
}

pub fn build_screen_sharing_end_packet(uid: &str, token: &str, receiver_hash: &str) -> ControlPacket {
    ControlPacket::new(
        PacketType::ScreenSharingEnd,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            receiver_hash: Some(receiver_hash.to_string()),
            ..Default::default()
        },
    )
}

pub fn build_camera_sharing_begin_packet(uid: &str, token: &str, receiver_hash: &str) -> ControlPacket {
    ControlPacket::new(
        PacketType::CameraSharingBegin,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            receiver_hash: Some(receiver_hash.to_string()),
            ..Default::default()
        },
    )
}

pub fn build_camera_sharing_end_packet(uid: &str, token: &str, receiver_hash: &str) -> ControlPacket {
    ControlPacket::new(
        PacketType::CameraSharingEnd,
        PacketBody {
            uid: Some(uid.to_string()),
            token: Some(token.to_string()),
            receiver_hash: Some(receiver_hash.to_string()),
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::state::{ActiveCall, IncomingCall, OutgoingCall};

    fn authorized_state() -> ClientState {
        let mut state = ClientState::default();
        state.connection = ConnectionState::Authorized(crate::state::AuthorizedState::Up);
        state
    }

    #[test]
    fn authorize_rejects_when_already_authorized() {
        let state = authorized_state();
        assert_eq!(check_authorize(&state), Err(ErrorCode::AlreadyAuthorized));
    }

    #[test]
    fn authorize_allowed_from_unauthorized() {
        let state = ClientState::default();
        assert_eq!(check_authorize(&state), Ok(()));
    }

    #[test]
    fn start_outgoing_call_rejects_with_active_call() {
        let mut state = authorized_state();
        state.active_call = Some(ActiveCall {
            peer_hash: "x".into(),
            peer_nickname: "bob".into(),
            peer_public_key: KeyPair::generate().public_key(),
            call_key: SymmetricKey::generate(),
            peer_connection_down: false,
        });
        assert_eq!(
            check_start_outgoing_call(&state),
            Err(ErrorCode::ActiveCallExists)
        );
    }

    #[test]
    fn start_outgoing_call_rejects_second_offer() {
        let mut state = authorized_state();
        state.outgoing_call = Some(OutgoingCall {
            peer_nickname: "bob".into(),
            peer_hash: "x".into(),
            peer_public_key: KeyPair::generate().public_key(),
            call_key: SymmetricKey::generate(),
        });
        assert_eq!(
            check_start_outgoing_call(&state),
            Err(ErrorCode::OperationInProgress)
        );
    }

    #[test]
    fn accept_call_rejects_unknown_peer() {
        let state = authorized_state();
        assert_eq!(
            check_accept_call(&state, "nobody"),
            Err(ErrorCode::NoIncomingCall)
        );
    }

    #[test]
    fn accept_call_rejects_while_in_flight() {
        let mut state = authorized_state();
        state.incoming_calls.insert(
            "bob-hash".into(),
            IncomingCall {
                peer_nickname: "bob".into(),
                peer_hash: "bob-hash".into(),
                peer_public_key: KeyPair::generate().public_key(),
                call_key: SymmetricKey::generate(),
            },
        );
        state.accept_in_flight = true;
        assert_eq!(
            check_accept_call(&state, "bob-hash"),
            Err(ErrorCode::OperationInProgress)
        );
    }

    #[test]
    fn calling_begin_roundtrips_through_decode() {
        let caller = KeyPair::generate();
        let callee = KeyPair::generate();
        let call_key = SymmetricKey::generate();
        let packet_key = SymmetricKey::generate();

        let packet = build_calling_begin_packet(
            "uid-1",
            "token-1",
            "caller-hash",
            "callee-hash",
            &caller.public_key(),
            "alice",
            &callee.public_key(),
            &call_key,
            &packet_key,
            4000,
        )
        .unwrap();

        let (decoded_public_key, decoded_call_key, nickname) =
            decode_calling_begin(&packet.body, &callee).unwrap();

        assert_eq!(decoded_public_key.as_bytes(), caller.public_key().as_bytes());
        assert_eq!(decoded_call_key.0, call_key.0);
        assert_eq!(nickname, "alice");
    }

    #[test]
    fn end_call_requires_active_call() {
        let state = authorized_state();
        assert_eq!(check_end_call(&state), Err(ErrorCode::NoActiveCall));
    }

    #[test]
    fn start_sharing_rejects_while_viewing_remote_screen() {
        let mut state = authorized_state();
        state.active_call = Some(ActiveCall {
            peer_hash: "x".into(),
            peer_nickname: "bob".into(),
            peer_public_key: KeyPair::generate().public_key(),
            call_key: SymmetricKey::generate(),
            peer_connection_down: false,
        });
        state.viewing_remote_screen = true;
        assert_eq!(
            check_start_sharing(&state, SharingState::Stopped),
            Err(ErrorCode::ViewingRemoteScreen)
        );
    }
}
