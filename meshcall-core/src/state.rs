//! Client-side state machine (spec §4.5, entities from §3).

use std::collections::HashMap;

use x25519_dalek::PublicKey;

use crate::crypto::{KeyPair, SymmetricKey};

/// Top-level connection/authorization state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthorized,
    Authorizing,
    Authorized(AuthorizedState),
    Reconnecting,
}

/// Whether the control channel is currently believed healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizedState {
    Up,
    Down,
}

/// Local media-sharing flag lifecycle (spec §2.8).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SharingState {
    #[default]
    Stopped,
    Starting,
    Active,
}

/// A call this client placed to a peer, awaiting accept/decline/timeout
/// (spec §3 "PendingCall", outgoing side). The call key and the callee's
/// public key are generated/fetched when the offer is built and held here
/// so accepting the call (on the `CallAccept` mirror) doesn't need to
/// re-derive them.
#[derive(Debug, Clone)]
pub struct OutgoingCall {
    pub peer_nickname: String,
    pub peer_hash: String,
    pub peer_public_key: PublicKey,
    pub call_key: SymmetricKey,
}

/// A call a peer placed to this client, awaiting the local user's
/// accept/decline (spec §3 "PendingCall", incoming side). The peer's
/// public key and the call key it proposed arrive with the CALLING_BEGIN
/// packet and must be held until accept/decline resolves it.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub peer_nickname: String,
    pub peer_hash: String,
    pub peer_public_key: PublicKey,
    pub call_key: SymmetricKey,
}

/// The single call this client may have live at once (spec §3
/// "ActiveCall"). `peer_connection_down` tracks the
/// CONNECTION_DOWN_WITH_USER / CONNECTION_RESTORED_WITH_USER notifications
/// the server sends about this specific partner (spec §4.7).
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub peer_hash: String,
    pub peer_nickname: String,
    pub peer_public_key: PublicKey,
    pub call_key: SymmetricKey,
    pub peer_connection_down: bool,
}

/// Everything the client core tracks about the locally signed-in user and
/// its current peers. A client may have at most one outgoing call, one
/// active call, and any number of incoming calls pending simultaneously
/// (spec §3, §4.6).
pub struct ClientState {
    pub connection: ConnectionState,
    pub identity: Option<Identity>,
    pub outgoing_call: Option<OutgoingCall>,
    pub incoming_calls: HashMap<String, IncomingCall>,
    pub active_call: Option<ActiveCall>,
    /// Set while an ACCEPT_CALL request is in flight, so a second
    /// concurrent accept attempt on the same peer is rejected as
    /// `OperationInProgress` rather than racing it (spec §4.6).
    pub accept_in_flight: bool,
    /// Set from the moment `startOutgoingCall` begins the GET_USER_INFO /
    /// CALLING_BEGIN chain until it resolves, so a second concurrent call
    /// attempt is rejected before an `OutgoingCall` entity even exists.
    pub starting_outgoing_call: bool,
    pub screen_sharing: SharingState,
    pub camera_sharing: SharingState,
    pub viewing_remote_screen: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Unauthorized,
            identity: None,
            outgoing_call: None,
            incoming_calls: HashMap::new(),
            active_call: None,
            accept_in_flight: false,
            starting_outgoing_call: false,
            screen_sharing: SharingState::Stopped,
            camera_sharing: SharingState::Stopped,
            viewing_remote_screen: false,
        }
    }
}

/// The locally authorized user's identity and session token, kept around
/// across a reconnect so the client can re-present the same token without
/// involving the application (spec §4.8).
pub struct Identity {
    pub nickname: String,
    pub nickname_hash: String,
    pub token: String,
    pub keypair: KeyPair,
}

impl ClientState {
    pub fn is_authorized(&self) -> bool {
        matches!(self.connection, ConnectionState::Authorized(_))
    }

    pub fn is_up(&self) -> bool {
        matches!(
            self.connection,
            ConnectionState::Authorized(AuthorizedState::Up)
        )
    }

    pub fn has_active_call(&self) -> bool {
        self.active_call.is_some()
    }

    pub fn has_outgoing_call(&self) -> bool {
        self.outgoing_call.is_some()
    }

    pub fn active_peer_hash(&self) -> Option<&str> {
        self.active_call.as_ref().map(|c| c.peer_hash.as_str())
    }

    /// Whether `peer_hash` is the other party of the current active call,
    /// if any (used to validate CALL_END / media frames reference the
    /// right partner).
    pub fn is_active_peer(&self, peer_hash: &str) -> bool {
        self.active_call
            .as_ref()
            .is_some_and(|c| c.peer_hash == peer_hash)
    }

    /// Tear down every call-related piece of state, as happens on logout or
    /// on a fresh re-authorization after reconnect (spec §4.7, §4.8).
    pub fn clear_calls(&mut self) {
        self.outgoing_call = None;
        self.incoming_calls.clear();
        self.active_call = None;
        self.accept_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_no_calls() {
        let state = ClientState::default();
        assert!(!state.has_active_call());
        assert!(!state.has_outgoing_call());
        assert!(state.incoming_calls.is_empty());
    }

    #[test]
    fn active_peer_hash_reflects_active_call() {
        let mut state = ClientState::default();
        assert_eq!(state.active_peer_hash(), None);
        state.active_call = Some(ActiveCall {
            peer_hash: "abc".into(),
            peer_nickname: "bob".into(),
            peer_public_key: KeyPair::generate().public_key(),
            call_key: SymmetricKey::generate(),
            peer_connection_down: false,
        });
        assert_eq!(state.active_peer_hash(), Some("abc"));
        assert!(state.is_active_peer("abc"));
        assert!(!state.is_active_peer("xyz"));
    }

    #[test]
    fn clear_calls_resets_everything() {
        let mut state = ClientState::default();
        state.outgoing_call = Some(OutgoingCall {
            peer_nickname: "bob".into(),
            peer_hash: "abc".into(),
            peer_public_key: KeyPair::generate().public_key(),
            call_key: SymmetricKey::generate(),
        });
        state.accept_in_flight = true;
        state.clear_calls();
        assert!(state.outgoing_call.is_none());
        assert!(!state.accept_in_flight);
    }
}
