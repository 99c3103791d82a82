//! ServerRegistry (spec §2.9, §3, §4.7): the authoritative server-side
//! state — users, pending calls, active calls — behind one coarse lock
//! (spec §5 "one coarse mutex per aggregate").
//!
//! A `PendingCall`/`ActiveCall` is shared by two [`User`] entries; spec §9
//! recommends an arena-and-index model over shared pointers so tearing one
//! down from either side is a single arena free. The pack carries no
//! `slab` dependency to justify pulling one in for this alone, so [`Slab`]
//! below is a small hand-rolled stand-in (grounded on `user.h`/
//! `pendingCall.cpp`/`call.cpp` for the shape of what it holds).
//!
//! Every request body but `Authorization` itself carries a bare `token`
//! and no `nickname_hash` (see `meshcall_core::signalling`'s packet
//! builders) — the server resolves the acting user from `token` via
//! `token_index` rather than trusting a connection's in-memory identity,
//! matching the explicit per-request `token` field the wire format
//! carries.

use std::collections::HashMap;
use std::net::SocketAddr;

use meshcall_core::wire::{ControlPacket, PacketBody, PacketType};
use meshcall_core::ErrorCode;
use tokio::sync::mpsc;

/// Minimal open-addressed arena: reused indices come from `free` before the
/// backing `Vec` grows. No generation counter — timer closures that hold
/// an id across an `await` validate it's still the same logical call via
/// a token field on the stored value itself.
struct Slab<T> {
    entries: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self { entries: Vec::new(), free: Vec::new() }
    }
}

impl<T> Slab<T> {
    fn insert(&mut self, value: T) -> usize {
        if let Some(idx) = self.free.pop() {
            self.entries[idx] = Some(value);
            idx
        } else {
            self.entries.push(Some(value));
            self.entries.len() - 1
        }
    }

    fn remove(&mut self, idx: usize) -> Option<T> {
        let slot = self.entries.get_mut(idx)?.take();
        if slot.is_some() {
            self.free.push(idx);
        }
        slot
    }

    fn get(&self, idx: usize) -> Option<&T> {
        self.entries.get(idx)?.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingCallId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActiveCallId(usize);

/// A control-channel sender for one authorized user's connection; cloned
/// out of the registry so callers can write packets after releasing the
/// lock.
pub type PacketTx = mpsc::Sender<ControlPacket>;

struct PendingCall {
    initiator_hash: String,
    receiver_hash: String,
    /// Bumped per creation; a 32s GC timer captured at creation time only
    /// acts if this still matches (mirrors `meshcall_core::client`'s
    /// `next_timer_seq` guard).
    token: u64,
}

struct ActiveCall {
    a_hash: String,
    b_hash: String,
}

impl ActiveCall {
    fn partner_of(&self, hash: &str) -> Option<&str> {
        if self.a_hash == hash {
            Some(&self.b_hash)
        } else if self.b_hash == hash {
            Some(&self.a_hash)
        } else {
            None
        }
    }

    fn has(&self, hash: &str) -> bool {
        self.a_hash == hash || self.b_hash == hash
    }
}

pub struct User {
    pub nickname_hash: String,
    pub public_key: String,
    pub token: String,
    pub control_tx: PacketTx,
    pub media_addr: SocketAddr,
    pub connection_down: bool,
    /// Bumped whenever the connection-down grace period (re)starts, so a
    /// stale grace-period timer no-ops if the user reconnected meanwhile.
    down_token: u64,
    outgoing_pending_call: Option<PendingCallId>,
    incoming_pending_calls: Vec<PendingCallId>,
    active_call: Option<ActiveCallId>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    /// token -> nickname_hash, since most request bodies carry only a
    /// token and must be resolved to an acting user.
    token_index: HashMap<String, String>,
    media_index: HashMap<SocketAddr, String>,
    pending_calls: Slab<PendingCall>,
    active_calls: Slab<ActiveCall>,
    next_call_token: u64,
}

/// A packet to deliver to a still-connected peer, produced by a registry
/// operation after its critical section but sent by the caller — the map
/// lock is never held across channel I/O (spec §5).
pub struct Notify {
    pub hash: String,
    pub tx: PacketTx,
    pub packet: ControlPacket,
}

/// Identifies a live connection's sender without committing to a packet,
/// for callers (sharing begin/end) that build the forward packet
/// themselves from context the registry doesn't hold.
pub struct PeerTarget {
    pub hash: String,
    pub tx: PacketTx,
}

pub enum ReconnectOutcome {
    Accepted { is_active_call: bool, restored_notify: Option<Notify> },
    Rejected,
}

fn sender_packet(packet_type: PacketType, sender_hash: &str) -> ControlPacket {
    ControlPacket::new(
        packet_type,
        PacketBody { sender_hash: Some(sender_hash.to_string()), ..Default::default() },
    )
}

pub struct Registry {
    inner: parking_lot::Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self { inner: parking_lot::Mutex::new(Inner::default()) }
    }

    pub fn authorize(
        &self,
        nickname_hash: &str,
        public_key: String,
        media_addr: SocketAddr,
        control_tx: PacketTx,
    ) -> Result<String, ErrorCode> {
        let mut inner = self.inner.lock();
        if inner.users.contains_key(nickname_hash) {
            return Err(ErrorCode::TakenNickname);
        }
        let token = meshcall_core::crypto::generate_token();
        inner.token_index.insert(token.clone(), nickname_hash.to_string());
        inner.media_index.insert(media_addr, nickname_hash.to_string());
        inner.users.insert(
            nickname_hash.to_string(),
            User {
                nickname_hash: nickname_hash.to_string(),
                public_key,
                token: token.clone(),
                control_tx,
                media_addr,
                connection_down: false,
                down_token: 0,
                outgoing_pending_call: None,
                incoming_pending_calls: Vec::new(),
                active_call: None,
            },
        );
        Ok(token)
    }

    fn resolve(inner: &Inner, token: &str) -> Result<String, ErrorCode> {
        inner.token_index.get(token).cloned().ok_or(ErrorCode::NotAuthorized)
    }

    pub fn resolve_hash(&self, token: &str) -> Option<String> {
        self.inner.lock().token_index.get(token).cloned()
    }

    /// Shared teardown for LOGOUT, an abrupt disconnect, and a
    /// connection-down grace period expiring without a RECONNECT: notify
    /// every pending/active counterparty and remove the user.
    fn teardown(&self, nickname_hash: &str) -> Vec<Notify> {
        let mut inner = self.inner.lock();
        let Some(user) = inner.users.remove(nickname_hash) else {
            return Vec::new();
        };
        inner.media_index.remove(&user.media_addr);
        inner.token_index.remove(&user.token);

        let mut notifies = Vec::new();

        if let Some(pid) = user.outgoing_pending_call {
            if let Some(pending) = inner.pending_calls.remove(pid.0) {
                if let Some(receiver) = inner.users.get_mut(&pending.receiver_hash) {
                    receiver.incoming_pending_calls.retain(|id| *id != pid);
                    if !receiver.connection_down {
                        notifies.push(Notify {
                            hash: receiver.nickname_hash.clone(),
                            tx: receiver.control_tx.clone(),
                            packet: sender_packet(PacketType::UserLogout, nickname_hash),
                        });
                    }
                }
            }
        }

        for pid in user.incoming_pending_calls {
            if let Some(pending) = inner.pending_calls.remove(pid.0) {
                if let Some(initiator) = inner.users.get_mut(&pending.initiator_hash) {
                    initiator.outgoing_pending_call = None;
                    if !initiator.connection_down {
                        notifies.push(Notify {
                            hash: initiator.nickname_hash.clone(),
                            tx: initiator.control_tx.clone(),
                            packet: sender_packet(PacketType::UserLogout, nickname_hash),
                        });
                    }
                }
            }
        }

        if let Some(aid) = user.active_call {
            if let Some(active) = inner.active_calls.remove(aid.0) {
                if let Some(partner_hash) = active.partner_of(nickname_hash).map(str::to_string) {
                    if let Some(partner) = inner.users.get_mut(&partner_hash) {
                        partner.active_call = None;
                        if !partner.connection_down {
                            notifies.push(Notify {
                                hash: partner.nickname_hash.clone(),
                                tx: partner.control_tx.clone(),
                                packet: sender_packet(PacketType::UserLogout, nickname_hash),
                            });
                        }
                    }
                }
            }
        }

        notifies
    }

    pub fn logout(&self, token: &str) -> Result<Vec<Notify>, ErrorCode> {
        let hash = {
            let inner = self.inner.lock();
            Self::resolve(&inner, token)?
        };
        Ok(self.teardown(&hash))
    }

    /// Called when the connection behind `nickname_hash` drops without a
    /// clean LOGOUT (TCP read error, EOF). Identical teardown to LOGOUT.
    pub fn disconnect(&self, nickname_hash: &str) -> Vec<Notify> {
        self.teardown(nickname_hash)
    }

    /// Whether `tx` is still the live control-channel sender for
    /// `nickname_hash` — used by a dying connection to decide whether it's
    /// safe to act on that user's behalf. A connection that lost a race
    /// against a concurrent RECONNECT on a fresh socket must not mark the
    /// (now-current) user down or tear it down out from under the winner.
    pub fn owns_connection(&self, nickname_hash: &str, tx: &PacketTx) -> bool {
        self.inner
            .lock()
            .users
            .get(nickname_hash)
            .is_some_and(|u| u.control_tx.same_channel(tx))
    }

    pub fn reconnect(
        &self,
        nickname_hash: &str,
        token: &str,
        new_addr: SocketAddr,
        new_control_tx: PacketTx,
    ) -> ReconnectOutcome {
        let mut inner = self.inner.lock();
        let Some(user) = inner.users.get(nickname_hash) else {
            return ReconnectOutcome::Rejected;
        };
        if user.token != token {
            return ReconnectOutcome::Rejected;
        }

        let old_addr = user.media_addr;
        let active_id = user.active_call;
        let is_active_call = active_id.is_some();

        let user = inner.users.get_mut(nickname_hash).unwrap();
        user.connection_down = false;
        user.down_token = user.down_token.wrapping_add(1);
        user.media_addr = new_addr;
        user.control_tx = new_control_tx;
        inner.media_index.remove(&old_addr);
        inner.media_index.insert(new_addr, nickname_hash.to_string());

        let mut restored_notify = None;
        if let Some(aid) = active_id {
            if let Some(partner_hash) =
                inner.active_calls.get(aid.0).and_then(|a| a.partner_of(nickname_hash)).map(str::to_string)
            {
                if let Some(partner) = inner.users.get(&partner_hash) {
                    restored_notify = Some(Notify {
                        hash: partner.nickname_hash.clone(),
                        tx: partner.control_tx.clone(),
                        packet: sender_packet(PacketType::ConnectionRestoredWithUser, nickname_hash),
                    });
                }
            }
        }

        ReconnectOutcome::Accepted { is_active_call, restored_notify }
    }

    pub fn get_user_info(&self, token: &str, target_hash: &str) -> Result<String, ErrorCode> {
        let inner = self.inner.lock();
        Self::resolve(&inner, token)?;
        inner.users.get(target_hash).map(|u| u.public_key.clone()).ok_or(ErrorCode::UnexistingUser)
    }

    /// CALLING_BEGIN (spec §4.7): always creates the `PendingCall` even if
    /// the receiver is offline — the receiver never finds out until it
    /// reconnects and polls, and the 32s GC timer armed by the caller with
    /// the returned token is the only thing that ever removes it if nobody
    /// answers. The `IncomingCall` forward, if any, is built by the caller
    /// from the original request body (it carries fields — the wrapped
    /// call key, the encrypted nickname — the registry never touches).
    pub fn start_calling(
        &self,
        initiator_hash: &str,
        receiver_hash: &str,
    ) -> Result<(PendingCallId, u64, Option<PeerTarget>), ErrorCode> {
        let mut inner = self.inner.lock();
        if !inner.users.contains_key(receiver_hash) {
            return Err(ErrorCode::UnexistingUser);
        }
        let already_calling = inner
            .users
            .get(initiator_hash)
            .map(|u| u.outgoing_pending_call.is_some())
            .unwrap_or(true);
        if already_calling {
            return Err(ErrorCode::OperationInProgress);
        }

        let call_token = inner.next_call_token;
        inner.next_call_token += 1;
        let pid = PendingCallId(inner.pending_calls.insert(PendingCall {
            initiator_hash: initiator_hash.to_string(),
            receiver_hash: receiver_hash.to_string(),
            token: call_token,
        }));

        if let Some(initiator) = inner.users.get_mut(initiator_hash) {
            initiator.outgoing_pending_call = Some(pid);
        }
        let receiver = inner.users.get_mut(receiver_hash).unwrap();
        receiver.incoming_pending_calls.push(pid);
        let target = (!receiver.connection_down)
            .then(|| PeerTarget { hash: receiver.nickname_hash.clone(), tx: receiver.control_tx.clone() });

        Ok((pid, call_token, target))
    }

    /// CALLING_END (spec §4.7): the caller withdrawing their own
    /// outstanding offer before the receiver answers. Forwarded as
    /// `IncomingCallExpired` so the receiver runs the exact same local
    /// cleanup it would on its own 32s timeout.
    pub fn calling_end(&self, initiator_hash: &str, receiver_hash: &str) -> Result<Option<Notify>, ErrorCode> {
        let mut inner = self.inner.lock();
        let Some(pid) = inner.users.get(initiator_hash).and_then(|u| u.outgoing_pending_call) else {
            return Err(ErrorCode::NoOutgoingCall);
        };
        let Some(pending) = inner.pending_calls.get(pid.0) else {
            return Err(ErrorCode::NoOutgoingCall);
        };
        if pending.receiver_hash != receiver_hash {
            return Err(ErrorCode::NoOutgoingCall);
        }
        inner.pending_calls.remove(pid.0);
        if let Some(initiator) = inner.users.get_mut(initiator_hash) {
            initiator.outgoing_pending_call = None;
        }
        let notify = if let Some(receiver) = inner.users.get_mut(receiver_hash) {
            receiver.incoming_pending_calls.retain(|id| *id != pid);
            (!receiver.connection_down).then(|| Notify {
                hash: receiver.nickname_hash.clone(),
                tx: receiver.control_tx.clone(),
                packet: sender_packet(PacketType::IncomingCallExpired, initiator_hash),
            })
        } else {
            None
        };
        Ok(notify)
    }

    /// Silent GC for a `PendingCall` whose 32s timer fired with nobody
    /// having accepted, declined, or withdrawn it — both client-side peers
    /// run the identical 32s timeout locally, so the server doesn't need
    /// to tell anyone anything, only forget the call.
    pub fn expire_pending_call(&self, pending_id: PendingCallId, call_token: u64) {
        let mut inner = self.inner.lock();
        let Some(pending) = inner.pending_calls.get(pending_id.0) else { return };
        if pending.token != call_token {
            return;
        }
        let initiator_hash = pending.initiator_hash.clone();
        let receiver_hash = pending.receiver_hash.clone();
        inner.pending_calls.remove(pending_id.0);
        if let Some(initiator) = inner.users.get_mut(&initiator_hash) {
            initiator.outgoing_pending_call = None;
        }
        if let Some(receiver) = inner.users.get_mut(&receiver_hash) {
            receiver.incoming_pending_calls.retain(|id| *id != pending_id);
        }
    }

    /// CALL_ACCEPT (spec §4.7): converts the matching `PendingCall` into an
    /// `ActiveCall`. Any other pending offers `accepter_hash` was holding
    /// are left alone here — the client drives their teardown with its own
    /// explicit CALL_DECLINE/CALLING_END requests before this one arrives.
    pub fn call_accept(&self, accepter_hash: &str, initiator_hash: &str) -> Result<Notify, ErrorCode> {
        let mut inner = self.inner.lock();
        let pid = inner
            .users
            .get(accepter_hash)
            .into_iter()
            .flat_map(|u| u.incoming_pending_calls.iter().copied())
            .find(|pid| inner.pending_calls.get(pid.0).is_some_and(|p| p.initiator_hash == initiator_hash))
            .ok_or(ErrorCode::NoIncomingCall)?;

        inner.pending_calls.remove(pid.0);
        if let Some(accepter) = inner.users.get_mut(accepter_hash) {
            accepter.incoming_pending_calls.retain(|id| *id != pid);
        }
        if let Some(initiator) = inner.users.get_mut(initiator_hash) {
            initiator.outgoing_pending_call = None;
        }

        let aid = ActiveCallId(inner.active_calls.insert(ActiveCall {
            a_hash: accepter_hash.to_string(),
            b_hash: initiator_hash.to_string(),
        }));
        if let Some(accepter) = inner.users.get_mut(accepter_hash) {
            accepter.active_call = Some(aid);
        }
        if let Some(initiator) = inner.users.get_mut(initiator_hash) {
            initiator.active_call = Some(aid);
        }

        let initiator = inner.users.get(initiator_hash).ok_or(ErrorCode::UnexistingUser)?;
        Ok(Notify {
            hash: initiator.nickname_hash.clone(),
            tx: initiator.control_tx.clone(),
            packet: sender_packet(PacketType::CallAccept, accepter_hash),
        })
    }

    pub fn call_decline(&self, decliner_hash: &str, initiator_hash: &str) -> Result<Option<Notify>, ErrorCode> {
        let mut inner = self.inner.lock();
        let pid = inner
            .users
            .get(decliner_hash)
            .into_iter()
            .flat_map(|u| u.incoming_pending_calls.iter().copied())
            .find(|pid| inner.pending_calls.get(pid.0).is_some_and(|p| p.initiator_hash == initiator_hash))
            .ok_or(ErrorCode::NoIncomingCall)?;

        inner.pending_calls.remove(pid.0);
        if let Some(decliner) = inner.users.get_mut(decliner_hash) {
            decliner.incoming_pending_calls.retain(|id| *id != pid);
        }
        let notify = if let Some(initiator) = inner.users.get_mut(initiator_hash) {
            initiator.outgoing_pending_call = None;
            (!initiator.connection_down).then(|| Notify {
                hash: initiator.nickname_hash.clone(),
                tx: initiator.control_tx.clone(),
                packet: sender_packet(PacketType::CallDecline, decliner_hash),
            })
        } else {
            None
        };
        Ok(notify)
    }

    pub fn call_end(&self, ender_hash: &str, peer_hash: &str) -> Result<Option<Notify>, ErrorCode> {
        let mut inner = self.inner.lock();
        let aid = inner.users.get(ender_hash).and_then(|u| u.active_call).ok_or(ErrorCode::NoActiveCall)?;
        let matches = inner.active_calls.get(aid.0).is_some_and(|a| a.has(ender_hash) && a.has(peer_hash));
        if !matches {
            return Err(ErrorCode::NoActiveCall);
        }
        inner.active_calls.remove(aid.0);
        if let Some(ender) = inner.users.get_mut(ender_hash) {
            ender.active_call = None;
        }
        let notify = if let Some(partner) = inner.users.get_mut(peer_hash) {
            partner.active_call = None;
            (!partner.connection_down).then(|| Notify {
                hash: partner.nickname_hash.clone(),
                tx: partner.control_tx.clone(),
                packet: sender_packet(PacketType::CallEnd, ender_hash),
            })
        } else {
            None
        };
        Ok(notify)
    }

    /// Looks up the active-call partner of `hash`, for the media-sharing
    /// begin/end handlers — they carry no registry state of their own,
    /// only a forward to whoever is on the other end of the active call.
    pub fn active_partner(&self, hash: &str) -> Result<PeerTarget, ErrorCode> {
        let inner = self.inner.lock();
        let aid = inner.users.get(hash).and_then(|u| u.active_call).ok_or(ErrorCode::NoActiveCall)?;
        let partner_hash =
            inner.active_calls.get(aid.0).and_then(|a| a.partner_of(hash)).ok_or(ErrorCode::NoActiveCall)?;
        let partner = inner.users.get(partner_hash).ok_or(ErrorCode::NoActiveCall)?;
        Ok(PeerTarget { hash: partner.nickname_hash.clone(), tx: partner.control_tx.clone() })
    }

    /// Driven by the media relay's silence sweep (spec §4.7 "Connection-down
    /// on server"): flags the user down and tells every pending/active
    /// counterparty, without tearing anything down yet. Returns the
    /// down-generation token the caller arms its grace-period timer with.
    pub fn mark_connection_down(&self, nickname_hash: &str) -> Option<(u64, Vec<Notify>)> {
        let mut inner = self.inner.lock();
        let user = inner.users.get(nickname_hash)?;
        if user.connection_down {
            return None;
        }
        let outgoing = user.outgoing_pending_call;
        let incoming = user.incoming_pending_calls.clone();
        let active = user.active_call;

        let user = inner.users.get_mut(nickname_hash).unwrap();
        user.connection_down = true;
        user.down_token = user.down_token.wrapping_add(1);
        let down_token = user.down_token;

        let mut notifies = Vec::new();
        if let Some(pid) = outgoing {
            if let Some(receiver_hash) = inner.pending_calls.get(pid.0).map(|p| p.receiver_hash.clone()) {
                if let Some(receiver) = inner.users.get(&receiver_hash) {
                    if !receiver.connection_down {
                        notifies.push(Notify {
                            hash: receiver.nickname_hash.clone(),
                            tx: receiver.control_tx.clone(),
                            packet: sender_packet(PacketType::ConnectionDownWithUser, nickname_hash),
                        });
                    }
                }
            }
        }
        for pid in incoming {
            if let Some(initiator_hash) = inner.pending_calls.get(pid.0).map(|p| p.initiator_hash.clone()) {
                if let Some(initiator) = inner.users.get(&initiator_hash) {
                    if !initiator.connection_down {
                        notifies.push(Notify {
                            hash: initiator.nickname_hash.clone(),
                            tx: initiator.control_tx.clone(),
                            packet: sender_packet(PacketType::ConnectionDownWithUser, nickname_hash),
                        });
                    }
                }
            }
        }
        if let Some(aid) = active {
            if let Some(partner_hash) = inner.active_calls.get(aid.0).and_then(|a| a.partner_of(nickname_hash)).map(str::to_string) {
                if let Some(partner) = inner.users.get(&partner_hash) {
                    if !partner.connection_down {
                        notifies.push(Notify {
                            hash: partner.nickname_hash.clone(),
                            tx: partner.control_tx.clone(),
                            packet: sender_packet(PacketType::ConnectionDownWithUser, nickname_hash),
                        });
                    }
                }
            }
        }

        Some((down_token, notifies))
    }

    /// Fires when the ~2 min grace period elapses without a RECONNECT;
    /// no-ops if the user already reconnected (its `down_token` moved on)
    /// or logged out in the meantime.
    pub fn expire_down_grace_period(&self, nickname_hash: &str, down_token: u64) -> Vec<Notify> {
        {
            let inner = self.inner.lock();
            match inner.users.get(nickname_hash) {
                Some(user) if user.connection_down && user.down_token == down_token => {}
                _ => return Vec::new(),
            }
        }
        self.teardown(nickname_hash)
    }

    /// Endpoint -> acting user, for the media relay's pair lookup and
    /// silence-sweep bookkeeping (spec §4.9).
    pub fn hash_for_media_addr(&self, addr: SocketAddr) -> Option<String> {
        self.inner.lock().media_index.get(&addr).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    fn chan() -> PacketTx {
        mpsc::channel(8).0
    }

    fn authorize(registry: &Registry, hash: &str, port: u16) -> String {
        registry.authorize(hash, format!("pk-{hash}"), addr(port), chan()).unwrap()
    }

    #[test]
    fn duplicate_nickname_is_rejected() {
        let registry = Registry::new();
        authorize(&registry, "alice", 1);
        assert_eq!(registry.authorize("alice", "pk".into(), addr(2), chan()), Err(ErrorCode::TakenNickname));
    }

    #[test]
    fn reconnect_rejects_wrong_token() {
        let registry = Registry::new();
        authorize(&registry, "alice", 1);
        assert!(matches!(
            registry.reconnect("alice", "not-the-token", addr(2), chan()),
            ReconnectOutcome::Rejected
        ));
    }

    #[test]
    fn reconnect_preserves_identity_and_updates_endpoint() {
        let registry = Registry::new();
        let token = authorize(&registry, "alice", 1);
        match registry.reconnect("alice", &token, addr(9), chan()) {
            ReconnectOutcome::Accepted { is_active_call, restored_notify } => {
                assert!(!is_active_call);
                assert!(restored_notify.is_none());
            }
            ReconnectOutcome::Rejected => panic!("expected acceptance"),
        }
        assert_eq!(registry.hash_for_media_addr(addr(9)), Some("alice".to_string()));
        assert_eq!(registry.hash_for_media_addr(addr(1)), None);
        assert_eq!(registry.get_user_info(&token, "alice").unwrap(), "pk-alice");
    }

    /// spec §3 "a server user has at most one outgoing pending call at a
    /// time": a second CALLING_BEGIN while one is outstanding is rejected.
    #[test]
    fn at_most_one_outgoing_pending_call() {
        let registry = Registry::new();
        authorize(&registry, "alice", 1);
        authorize(&registry, "bob", 2);
        authorize(&registry, "carol", 3);

        registry.start_calling("alice", "bob").unwrap();
        assert_eq!(registry.start_calling("alice", "carol"), Err(ErrorCode::OperationInProgress));
    }

    #[test]
    fn calling_unknown_receiver_fails() {
        let registry = Registry::new();
        authorize(&registry, "alice", 1);
        assert_eq!(registry.start_calling("alice", "ghost"), Err(ErrorCode::UnexistingUser));
    }

    /// spec §8 "call uniqueness": accepting one incoming call converts it
    /// into the single active call and leaves every other offer untouched
    /// at the registry layer (the client drives their explicit teardown).
    #[test]
    fn accept_converts_pending_into_active_and_clears_outgoing() {
        let registry = Registry::new();
        authorize(&registry, "alice", 1);
        authorize(&registry, "bob", 2);

        registry.start_calling("alice", "bob").unwrap();
        registry.call_accept("bob", "alice").unwrap();

        assert_eq!(registry.active_partner("alice").unwrap().hash, "bob");
        assert_eq!(registry.active_partner("bob").unwrap().hash, "alice");
        // The resolved offer can't be accepted or declined a second time.
        assert_eq!(registry.call_accept("bob", "alice"), Err(ErrorCode::NoIncomingCall));
    }

    #[test]
    fn call_end_requires_matching_active_partner() {
        let registry = Registry::new();
        authorize(&registry, "alice", 1);
        authorize(&registry, "bob", 2);
        authorize(&registry, "carol", 3);

        registry.start_calling("alice", "bob").unwrap();
        registry.call_accept("bob", "alice").unwrap();

        assert_eq!(registry.call_end("alice", "carol"), Err(ErrorCode::NoActiveCall));
        assert!(registry.call_end("alice", "bob").unwrap().is_some());
        assert_eq!(registry.active_partner("alice"), Err(ErrorCode::NoActiveCall));
        assert_eq!(registry.active_partner("bob"), Err(ErrorCode::NoActiveCall));
    }

    /// spec §4.7 LOGOUT / disconnect teardown: removes the user outright,
    /// freeing the nickname immediately rather than leaving it in a
    /// connection-down grace period.
    #[test]
    fn logout_frees_the_nickname() {
        let registry = Registry::new();
        let token = authorize(&registry, "alice", 1);
        registry.logout(&token).unwrap();
        assert!(registry.resolve_hash(&token).is_none());
        authorize(&registry, "alice", 5);
    }

    #[test]
    fn mark_connection_down_notifies_active_partner_and_is_idempotent() {
        let registry = Registry::new();
        authorize(&registry, "alice", 1);
        authorize(&registry, "bob", 2);
        registry.start_calling("alice", "bob").unwrap();
        registry.call_accept("bob", "alice").unwrap();

        let (down_token, notifies) = registry.mark_connection_down("alice").unwrap();
        assert_eq!(notifies.len(), 1);
        assert_eq!(notifies[0].hash, "bob");
        // Already down: a second sweep hit is a no-op, not a duplicate notify.
        assert!(registry.mark_connection_down("alice").is_none());

        // A stale down-generation doesn't tear anything down.
        assert!(registry.expire_down_grace_period("alice", down_token.wrapping_sub(1)).is_empty());
        assert!(registry.resolve_hash(&registry.inner.lock().users.get("alice").unwrap().token.clone()).is_some());
    }
}
