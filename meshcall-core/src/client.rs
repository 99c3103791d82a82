//! The client facade (spec §2.6-§2.8, §2.11): a single background task
//! owns [`ClientState`] directly and is driven by commands arriving over
//! an `mpsc` channel, mirroring `freeq-sdk`'s `ClientHandle`/`run_client`
//! split. Every public method on [`ClientHandle`] sends a command and
//! awaits a one-shot reply carrying the synchronous precondition result;
//! the operation's eventual outcome (did the server actually accept the
//! offer, did the peer answer) arrives later as an [`Event`].
//!
//! This is a deliberate read of spec §5's "one coarse mutex": a single
//! task that never shares `ClientState` behind a lock is simpler to
//! reason about than a `Mutex<ClientState>` touched from several tasks,
//! and gives the same single-writer guarantee the mutex was for.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration};
use x25519_dalek::PublicKey;

use crate::collaborators::AudioEngine;
use crate::crypto::{self, KeyPair, SymmetricKey};
use crate::error::ErrorCode;
use crate::event::Event;
use crate::media_ops::{self, MediaKind};
use crate::reconnect::{reconnect_loop, ReconnectOutcome};
use crate::signalling;
use crate::state::{
    ActiveCall, AuthorizedState, ClientState, ConnectionState, Identity, IncomingCall,
    OutgoingCall, SharingState,
};
use crate::task_manager::TaskManager;
use crate::transport::control::{ControlEvent, ControlTransport};
use crate::transport::media::{MediaDatagram, MediaTransport};
use crate::wire::{ControlPacket, PacketBody, PacketType};

/// Requests a [`ClientHandle`] can send to the actor. Every variant's
/// precondition is checked synchronously against `ClientState`; on
/// success the command's effect (a packet sent, a timer armed) happens
/// before the reply fires, but the operation's final outcome is an
/// [`Event`] delivered afterwards.
enum Command {
    Authorize(String),
    Logout,
    StartOutgoingCall(String),
    StopOutgoingCall,
    AcceptCall(String),
    DeclineCall(String),
    EndCall,
    StartScreenSharing,
    StopScreenSharing,
    StartCameraSharing,
    StopCameraSharing,
    SendVoiceFrame(Vec<u8>),
    SendScreenFrame(Vec<u8>),
    SendCameraFrame(Vec<u8>),
}

/// Handle to a running client actor. Cloning shares the same actor; the
/// actor shuts down once every clone (and its owning [`Client`], if any)
/// is dropped.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<(Command, oneshot::Sender<ErrorCode>)>,
}

impl ClientHandle {
    async fn call(&self, cmd: Command) -> ErrorCode {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send((cmd, reply_tx)).await.is_err() {
            return ErrorCode::NetworkError;
        }
        reply_rx.await.unwrap_or(ErrorCode::NetworkError)
    }

    /// Begin authorizing as `nickname` (spec §4.6 `authorize`). Connects
    /// the control and media transports as a side effect of the attempt.
    pub async fn authorize(&self, nickname: impl Into<String>) -> ErrorCode {
        self.call(Command::Authorize(nickname.into())).await
    }

    pub async fn logout(&self) -> ErrorCode {
        self.call(Command::Logout).await
    }

    pub async fn start_outgoing_call(&self, peer_nickname: impl Into<String>) -> ErrorCode {
        self.call(Command::StartOutgoingCall(peer_nickname.into())).await
    }

    pub async fn stop_outgoing_call(&self) -> ErrorCode {
        self.call(Command::StopOutgoingCall).await
    }

    pub async fn accept_call(&self, peer_nickname: impl Into<String>) -> ErrorCode {
        self.call(Command::AcceptCall(peer_nickname.into())).await
    }

    pub async fn decline_call(&self, peer_nickname: impl Into<String>) -> ErrorCode {
        self.call(Command::DeclineCall(peer_nickname.into())).await
    }

    pub async fn end_call(&self) -> ErrorCode {
        self.call(Command::EndCall).await
    }

    pub async fn start_screen_sharing(&self) -> ErrorCode {
        self.call(Command::StartScreenSharing).await
    }

    pub async fn stop_screen_sharing(&self) -> ErrorCode {
        self.call(Command::StopScreenSharing).await
    }

    pub async fn start_camera_sharing(&self) -> ErrorCode {
        self.call(Command::StartCameraSharing).await
    }

    pub async fn stop_camera_sharing(&self) -> ErrorCode {
        self.call(Command::StopCameraSharing).await
    }

    /// Encrypt and send one voice frame over the active call's media
    /// channel. Fire-and-forget at the network layer; the returned code
    /// only reports whether there was an active call to send it on.
    pub async fn send_voice_frame(&self, frame: Vec<u8>) -> ErrorCode {
        self.call(Command::SendVoiceFrame(frame)).await
    }

    pub async fn send_screen_frame(&self, frame: Vec<u8>) -> ErrorCode {
        self.call(Command::SendScreenFrame(frame)).await
    }

    pub async fn send_camera_frame(&self, frame: Vec<u8>) -> ErrorCode {
        self.call(Command::SendCameraFrame(frame)).await
    }
}

/// Entry point: spawns the actor task and returns the handle plus the
/// event stream. The control and media transports aren't connected until
/// the first [`ClientHandle::authorize`] call (spec §4.5 `Unauthorized`).
pub struct Client;

impl Client {
    pub fn spawn(
        control_addr: impl Into<String>,
        media_addr: SocketAddr,
        audio_engine: Option<Arc<dyn AudioEngine>>,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<Event>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            control_addr: control_addr.into(),
            media_addr,
            audio_engine,
            state: ClientState::default(),
            task_manager: TaskManager::new(),
            event_tx,
            internal_tx,
            internal_rx,
            control: None,
            control_rx: None,
            media: None,
            media_rx: None,
            pending: HashMap::new(),
            pending_identity: None,
            outgoing_timer: None,
            incoming_timers: HashMap::new(),
            next_timer_seq: 0,
            reconnect_cancel: None,
        };
        tokio::spawn(actor.run(cmd_rx));
        (ClientHandle { cmd_tx }, event_rx)
    }
}

/// Fan-in for signals the actor can't receive as a `Command` or a
/// `ControlEvent`: a task manager exhaustion, a pending-call timer firing,
/// or the reconnect loop concluding.
enum Internal {
    TaskExhausted(String),
    OutgoingTimeout { peer_hash: String, seq: u64 },
    IncomingTimeout { peer_hash: String, seq: u64 },
    Reconnected(ReconnectOutcome),
}

/// What to do when the request tagged by a `uid` either gets a reply or
/// times out. Holds whatever context the handler needs that isn't still
/// sitting in `ClientState` (because the optimistic local mutation, if
/// any, already happened at send time).
enum PendingKind {
    Authorize,
    Logout,
    GetUserInfoForCall { peer_nickname: String, peer_hash: String },
    CallingBegin {
        peer_hash: String,
        peer_nickname: String,
        peer_public_key: PublicKey,
        call_key: SymmetricKey,
    },
    CallingEnd { peer_hash: String },
    CallAccept { peer_hash: String, peer_nickname: String, peer_public_key: PublicKey, call_key: SymmetricKey },
    CallDecline { peer_hash: String },
    CallEnd { peer_hash: String },
    ScreenSharingBegin,
    ScreenSharingEnd,
    CameraSharingBegin,
    CameraSharingEnd,
    Reconnect,
}

struct Actor {
    control_addr: String,
    media_addr: SocketAddr,
    audio_engine: Option<Arc<dyn AudioEngine>>,

    state: ClientState,
    task_manager: TaskManager,

    event_tx: mpsc::UnboundedSender<Event>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    control: Option<ControlTransport>,
    control_rx: Option<mpsc::UnboundedReceiver<ControlEvent>>,
    media: Option<MediaTransport>,
    media_rx: Option<mpsc::UnboundedReceiver<MediaDatagram>>,

    pending: HashMap<String, PendingKind>,
    /// Stashed between sending AUTHORIZATION and its result, since
    /// `Identity` needs the server-minted token the result carries.
    pending_identity: Option<(String, String, KeyPair)>,

    outgoing_timer: Option<(String, u64)>,
    incoming_timers: HashMap<String, u64>,
    next_timer_seq: u64,

    reconnect_cancel: Option<oneshot::Sender<()>>,
}

/// Await the next item from an optional channel, pending forever while
/// `slot` is `None` so the owning `select!` branch simply never wins.
/// Clears `slot` itself once the inner channel closes, so a dead
/// transport doesn't spin the actor loop.
async fn recv_from<T>(slot: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match slot {
        Some(rx) => match rx.recv().await {
            Some(v) => Some(v),
            None => {
                *slot = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<(Command, oneshot::Sender<ErrorCode>)>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some((cmd, reply)) => self.handle_command(cmd, reply).await,
                        None => break,
                    }
                }
                ev = recv_from(&mut self.control_rx) => {
                    if let Some(ev) = ev {
                        self.handle_control_event(ev).await;
                    }
                }
                dg = recv_from(&mut self.media_rx) => {
                    if let Some(dg) = dg {
                        self.handle_media_datagram(dg);
                    }
                }
                internal = self.internal_rx.recv() => {
                    match internal {
                        Some(i) => self.handle_internal(i).await,
                        None => break,
                    }
                }
            }
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    fn identity(&self) -> Option<&Identity> {
        self.state.identity.as_ref()
    }

    /// Queue `packet` over the task manager, retrying on `control` until
    /// it's acked or exhausted (spec §4.3). Replies `ConnectionDown`
    /// immediately, bypassing the retry loop, if there's no transport.
    fn send_tracked(&mut self, uid: String, packet: ControlPacket, kind: PendingKind) -> Result<(), ErrorCode> {
        let Some(control) = self.control.clone() else {
            return Err(ErrorCode::ConnectionDown);
        };
        self.pending.insert(uid.clone(), kind);
        let internal_tx = self.internal_tx.clone();
        let uid_for_fail = uid.clone();
        self.task_manager.start(
            uid,
            Duration::from_millis(signalling::TASK_RETRY_INTERVAL_MS),
            signalling::TASK_MAX_ATTEMPTS,
            move || {
                control.try_send(packet.clone());
            },
            move || {
                let _ = internal_tx.send(Internal::TaskExhausted(uid_for_fail));
            },
        );
        Ok(())
    }

    fn start_outgoing_timer(&mut self, peer_hash: String) {
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        self.outgoing_timer = Some((peer_hash.clone(), seq));
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(signalling::PENDING_CALL_TIMEOUT_SECS)).await;
            let _ = internal_tx.send(Internal::OutgoingTimeout { peer_hash, seq });
        });
    }

    fn cancel_outgoing_timer(&mut self) {
        self.outgoing_timer = None;
    }

    fn start_incoming_timer(&mut self, peer_hash: String) {
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        self.incoming_timers.insert(peer_hash.clone(), seq);
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(signalling::PENDING_CALL_TIMEOUT_SECS)).await;
            let _ = internal_tx.send(Internal::IncomingTimeout { peer_hash, seq });
        });
    }

    fn cancel_incoming_timer(&mut self, peer_hash: &str) {
        self.incoming_timers.remove(peer_hash);
    }

    // ---- Command handling ----

    async fn handle_command(&mut self, cmd: Command, reply: oneshot::Sender<ErrorCode>) {
        match cmd {
            Command::Authorize(nickname) => self.do_authorize(nickname, reply).await,
            Command::Logout => self.do_logout(reply),
            Command::StartOutgoingCall(nickname) => self.do_start_outgoing_call(nickname, reply),
            Command::StopOutgoingCall => self.do_stop_outgoing_call(reply),
            Command::AcceptCall(nickname) => self.do_accept_call(nickname, reply),
            Command::DeclineCall(nickname) => self.do_decline_call(nickname, reply),
            Command::EndCall => self.do_end_call(reply),
            Command::StartScreenSharing => self.do_start_sharing(MediaKind::Screen, reply),
            Command::StopScreenSharing => self.do_stop_sharing(MediaKind::Screen, reply),
            Command::StartCameraSharing => self.do_start_sharing(MediaKind::Camera, reply),
            Command::StopCameraSharing => self.do_stop_sharing(MediaKind::Camera, reply),
            Command::SendVoiceFrame(frame) => self.do_send_media(MediaKind::Voice, frame, reply),
            Command::SendScreenFrame(frame) => self.do_send_media(MediaKind::Screen, frame, reply),
            Command::SendCameraFrame(frame) => self.do_send_media(MediaKind::Camera, frame, reply),
        }
    }

    async fn do_authorize(&mut self, nickname: String, reply: oneshot::Sender<ErrorCode>) {
        if let Err(code) = signalling::check_authorize(&self.state) {
            let _ = reply.send(code);
            return;
        }

        self.state.connection = ConnectionState::Authorizing;

        let control_addr = self.control_addr.clone();
        let control = match ControlTransport::connect(&control_addr).await {
            Ok((transport, events)) => {
                self.control = Some(transport);
                self.control_rx = Some(events);
                self.control.clone().unwrap()
            }
            Err(e) => {
                tracing::warn!(error = %e, "authorize: control connect failed");
                self.state.connection = ConnectionState::Unauthorized;
                let _ = reply.send(ErrorCode::NetworkError);
                return;
            }
        };
        let _ = control;

        let media = match MediaTransport::bind(self.media_addr).await {
            Ok((media, media_rx)) => {
                self.media_rx = Some(media_rx);
                media
            }
            Err(e) => {
                tracing::warn!(error = %e, "authorize: media bind failed");
                self.state.connection = ConnectionState::Unauthorized;
                self.control = None;
                self.control_rx = None;
                let _ = reply.send(ErrorCode::NetworkError);
                return;
            }
        };
        let udp_port = media.local_port().unwrap_or(0);
        self.media = Some(media);

        let keypair = KeyPair::generate();
        let nickname_hash = crypto::hash_nickname(&nickname);
        let uid = crypto::generate_uid();
        let packet = signalling::build_authorization_packet(&uid, &nickname_hash, &keypair.public_key(), udp_port);
        self.pending_identity = Some((nickname, nickname_hash, keypair));

        match self.send_tracked(uid, packet, PendingKind::Authorize) {
            Ok(()) => { let _ = reply.send(ErrorCode::Success); }
            Err(code) => {
                self.state.connection = ConnectionState::Unauthorized;
                self.pending_identity = None;
                let _ = reply.send(code);
            }
        }
    }

    fn do_logout(&mut self, reply: oneshot::Sender<ErrorCode>) {
        if let Err(code) = signalling::check_logout(&self.state) {
            let _ = reply.send(code);
            return;
        }
        let Some(identity) = self.identity() else {
            let _ = reply.send(ErrorCode::NotAuthorized);
            return;
        };
        let uid = crypto::generate_uid();
        let packet = signalling::build_logout_packet(&uid, &identity.token);
        match self.send_tracked(uid, packet, PendingKind::Logout) {
            Ok(()) => { let _ = reply.send(ErrorCode::Success); }
            Err(code) => {
                // No live transport to log out over; tear down locally anyway.
                self.teardown_after_logout();
                let _ = reply.send(code);
            }
        }
    }

    fn do_start_outgoing_call(&mut self, peer_nickname: String, reply: oneshot::Sender<ErrorCode>) {
        if let Err(code) = signalling::check_start_outgoing_call(&self.state) {
            let _ = reply.send(code);
            return;
        }
        let Some(identity) = self.identity() else {
            let _ = reply.send(ErrorCode::NotAuthorized);
            return;
        };
        let peer_hash = crypto::hash_nickname(&peer_nickname);
        let uid = crypto::generate_uid();
        let packet = signalling::build_get_user_info_packet(&uid, &identity.token, &peer_hash);

        self.state.starting_outgoing_call = true;
        match self.send_tracked(
            uid,
            packet,
            PendingKind::GetUserInfoForCall { peer_nickname, peer_hash },
        ) {
            Ok(()) => { let _ = reply.send(ErrorCode::Success); }
            Err(code) => {
                self.state.starting_outgoing_call = false;
                let _ = reply.send(code);
            }
        }
    }

    fn do_stop_outgoing_call(&mut self, reply: oneshot::Sender<ErrorCode>) {
        if let Err(code) = signalling::check_stop_outgoing_call(&self.state) {
            let _ = reply.send(code);
            return;
        }
        let Some(identity) = self.identity() else {
            let _ = reply.send(ErrorCode::NotAuthorized);
            return;
        };
        let peer_hash = self.state.outgoing_call.as_ref().unwrap().peer_hash.clone();
        let uid = crypto::generate_uid();
        let packet = signalling::build_calling_end_packet(&uid, &identity.token, &peer_hash);

        self.state.outgoing_call = None;
        self.state.starting_outgoing_call = false;
        self.cancel_outgoing_timer();

        match self.send_tracked(uid, packet, PendingKind::CallingEnd { peer_hash }) {
            Ok(()) => { let _ = reply.send(ErrorCode::Success); }
            Err(code) => { let _ = reply.send(code); }
        }
    }

    fn do_accept_call(&mut self, peer_nickname: String, reply: oneshot::Sender<ErrorCode>) {
        let peer_hash = crypto::hash_nickname(&peer_nickname);
        if let Err(code) = signalling::check_accept_call(&self.state, &peer_hash) {
            let _ = reply.send(code);
            return;
        }
        let Some(identity) = self.state.identity.as_ref() else {
            let _ = reply.send(ErrorCode::NotAuthorized);
            return;
        };
        let token = identity.token.clone();
        let our_hash = identity.nickname_hash.clone();
        let incoming = self.state.incoming_calls.get(&peer_hash).cloned_for_accept();

        // Decline every other pending offer before accepting this one
        // (spec §4.5 accept transition).
        let other_hashes: Vec<String> = self
            .state
            .incoming_calls
            .keys()
            .filter(|h| h.as_str() != peer_hash)
            .cloned()
            .collect();
        for other_hash in other_hashes {
            self.state.incoming_calls.remove(&other_hash);
            self.cancel_incoming_timer(&other_hash);
            let uid = crypto::generate_uid();
            let packet = signalling::build_call_decline_packet(&uid, &token, &other_hash);
            let _ = self.send_tracked(uid, packet, PendingKind::CallDecline { peer_hash: other_hash });
        }

        // Withdraw our own outgoing offer, if any.
        if let Some(outgoing) = self.state.outgoing_call.take() {
            self.cancel_outgoing_timer();
            let uid = crypto::generate_uid();
            let packet = signalling::build_calling_end_packet(&uid, &token, &outgoing.peer_hash);
            let _ = self.send_tracked(uid, packet, PendingKind::CallingEnd { peer_hash: outgoing.peer_hash });
        }

        // End any currently active call.
        if let Some(active) = self.state.active_call.take() {
            self.state.screen_sharing = SharingState::Stopped;
            self.state.camera_sharing = SharingState::Stopped;
            self.state.viewing_remote_screen = false;
            let uid = crypto::generate_uid();
            let packet = signalling::build_call_end_packet(&uid, &token, &active.peer_hash);
            let _ = self.send_tracked(uid, packet, PendingKind::CallEnd { peer_hash: active.peer_hash });
        }

        self.state.incoming_calls.remove(&peer_hash);
        self.cancel_incoming_timer(&peer_hash);

        let Some(incoming) = incoming else {
            let _ = reply.send(ErrorCode::NoIncomingCall);
            return;
        };
        let packet = match signalling::build_call_accept_packet(
            &crypto::generate_uid(),
            &token,
            &our_hash,
            &peer_hash,
            &incoming.peer_public_key,
            &incoming.call_key,
        ) {
            Ok(packet) => packet,
            Err(code) => {
                let _ = reply.send(code);
                return;
            }
        };
        let uid = packet.body.uid.clone().unwrap();

        self.state.accept_in_flight = true;
        let pending = PendingKind::CallAccept {
            peer_hash: peer_hash.clone(),
            peer_nickname: incoming.peer_nickname.clone(),
            peer_public_key: incoming.peer_public_key,
            call_key: incoming.call_key.clone(),
        };
        match self.send_tracked(uid, packet, pending) {
            Ok(()) => { let _ = reply.send(ErrorCode::Success); }
            Err(code) => {
                self.state.accept_in_flight = false;
                let _ = reply.send(code);
            }
        }
    }

    fn do_decline_call(&mut self, peer_nickname: String, reply: oneshot::Sender<ErrorCode>) {
        let peer_hash = crypto::hash_nickname(&peer_nickname);
        if let Err(code) = signalling::check_decline_call(&self.state, &peer_hash) {
            let _ = reply.send(code);
            return;
        }
        let Some(identity) = self.identity() else {
            let _ = reply.send(ErrorCode::NotAuthorized);
            return;
        };
        let uid = crypto::generate_uid();
        let packet = signalling::build_call_decline_packet(&uid, &identity.token, &peer_hash);

        self.state.incoming_calls.remove(&peer_hash);
        self.cancel_incoming_timer(&peer_hash);

        match self.send_tracked(uid, packet, PendingKind::CallDecline { peer_hash }) {
            Ok(()) => { let _ = reply.send(ErrorCode::Success); }
            Err(code) => { let _ = reply.send(code); }
        }
    }

    fn do_end_call(&mut self, reply: oneshot::Sender<ErrorCode>) {
        if let Err(code) = signalling::check_end_call(&self.state) {
            let _ = reply.send(code);
            return;
        }
        let Some(identity) = self.identity() else {
            let _ = reply.send(ErrorCode::NotAuthorized);
            return;
        };
        let peer_hash = self.state.active_call.as_ref().unwrap().peer_hash.clone();
        let uid = crypto::generate_uid();
        let packet = signalling::build_call_end_packet(&uid, &identity.token, &peer_hash);

        self.state.active_call = None;
        self.state.screen_sharing = SharingState::Stopped;
        self.state.camera_sharing = SharingState::Stopped;
        self.state.viewing_remote_screen = false;

        match self.send_tracked(uid, packet, PendingKind::CallEnd { peer_hash }) {
            Ok(()) => { let _ = reply.send(ErrorCode::Success); }
            Err(code) => { let _ = reply.send(code); }
        }
    }

    fn do_start_sharing(&mut self, kind: MediaKind, reply: oneshot::Sender<ErrorCode>) {
        let current = match kind {
            MediaKind::Screen => self.state.screen_sharing,
            MediaKind::Camera => self.state.camera_sharing,
            MediaKind::Voice => unreachable!("voice has no start/stop operation"),
        };
        let check = match kind {
            MediaKind::Screen => signalling::check_start_sharing(&self.state, current),
            MediaKind::Camera => signalling::check_start_camera_sharing(&self.state, current),
            MediaKind::Voice => unreachable!(),
        };
        if let Err(code) = check {
            let _ = reply.send(code);
            return;
        }
        let Some(identity) = self.identity() else {
            let _ = reply.send(ErrorCode::NotAuthorized);
            return;
        };
        let peer_hash = self.state.active_call.as_ref().unwrap().peer_hash.clone();
        let uid = crypto::generate_uid();
        let (packet, pending_kind) = match kind {
            MediaKind::Screen => (
                signalling::build_screen_sharing_begin_packet(&uid, &identity.token, &peer_hash),
                PendingKind::ScreenSharingBegin,
            ),
            MediaKind::Camera => (
                signalling::build_camera_sharing_begin_packet(&uid, &identity.token, &peer_hash),
                PendingKind::CameraSharingBegin,
            ),
            MediaKind::Voice => unreachable!(),
        };

        match kind {
            MediaKind::Screen => self.state.screen_sharing = SharingState::Starting,
            MediaKind::Camera => self.state.camera_sharing = SharingState::Starting,
            MediaKind::Voice => unreachable!(),
        }

        match self.send_tracked(uid, packet, pending_kind) {
            Ok(()) => { let _ = reply.send(ErrorCode::Success); }
            Err(code) => {
                match kind {
                    MediaKind::Screen => self.state.screen_sharing = SharingState::Stopped,
                    MediaKind::Camera => self.state.camera_sharing = SharingState::Stopped,
                    MediaKind::Voice => unreachable!(),
                }
                let _ = reply.send(code);
            }
        }
    }

    fn do_stop_sharing(&mut self, kind: MediaKind, reply: oneshot::Sender<ErrorCode>) {
        let (current, not_active) = match kind {
            MediaKind::Screen => (self.state.screen_sharing, ErrorCode::ScreenSharingNotActive),
            MediaKind::Camera => (self.state.camera_sharing, ErrorCode::CameraSharingNotActive),
            MediaKind::Voice => unreachable!("voice has no start/stop operation"),
        };
        if let Err(code) = signalling::check_stop_sharing(&self.state, current, not_active) {
            let _ = reply.send(code);
            return;
        }
        let Some(identity) = self.identity() else {
            let _ = reply.send(ErrorCode::NotAuthorized);
            return;
        };
        let peer_hash = self.state.active_call.as_ref().unwrap().peer_hash.clone();
        let uid = crypto::generate_uid();
        let (packet, pending_kind) = match kind {
            MediaKind::Screen => (
                signalling::build_screen_sharing_end_packet(&uid, &identity.token, &peer_hash),
                PendingKind::ScreenSharingEnd,
            ),
            MediaKind::Camera => (
                signalling::build_camera_sharing_end_packet(&uid, &identity.token, &peer_hash),
                PendingKind::CameraSharingEnd,
            ),
            MediaKind::Voice => unreachable!(),
        };

        match self.send_tracked(uid, packet, pending_kind) {
            Ok(()) => { let _ = reply.send(ErrorCode::Success); }
            Err(code) => { let _ = reply.send(code); }
        }
    }

    fn do_send_media(&mut self, kind: MediaKind, frame: Vec<u8>, reply: oneshot::Sender<ErrorCode>) {
        let Some(active) = &self.state.active_call else {
            let _ = reply.send(ErrorCode::NoActiveCall);
            return;
        };
        let sharing_ok = match kind {
            MediaKind::Voice => true,
            MediaKind::Screen => self.state.screen_sharing == SharingState::Active,
            MediaKind::Camera => self.state.camera_sharing == SharingState::Active,
        };
        if !sharing_ok {
            let code = match kind {
                MediaKind::Screen => ErrorCode::ScreenSharingNotActive,
                MediaKind::Camera => ErrorCode::CameraSharingNotActive,
                MediaKind::Voice => unreachable!(),
            };
            let _ = reply.send(code);
            return;
        }
        let Some(media) = &self.media else {
            let _ = reply.send(ErrorCode::ConnectionDown);
            return;
        };
        match media_ops::encrypt_frame(&active.call_key, &frame) {
            Some(wire) => {
                media.send(kind.packet_type(), wire);
                let _ = reply.send(ErrorCode::Success);
            }
            None => {
                let _ = reply.send(ErrorCode::EncryptionError);
            }
        }
    }

    fn teardown_after_logout(&mut self) {
        self.state.connection = ConnectionState::Unauthorized;
        self.state.identity = None;
        self.state.clear_calls();
        self.state.screen_sharing = SharingState::Stopped;
        self.state.camera_sharing = SharingState::Stopped;
        self.state.viewing_remote_screen = false;
        self.task_manager.cancel_all();
        self.pending.clear();
        self.control = None;
        self.control_rx = None;
        self.media = None;
        self.media_rx = None;
        self.outgoing_timer = None;
        self.incoming_timers.clear();
    }

    // ---- Control channel events ----

    async fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Packet(packet) => self.handle_control_packet(packet).await,
            ControlEvent::Down => self.handle_control_down(),
        }
    }

    fn handle_control_down(&mut self) {
        if !matches!(self.state.connection, ConnectionState::Authorized(_)) {
            return;
        }

        if let Some(outgoing) = self.state.outgoing_call.take() {
            self.cancel_outgoing_timer();
            self.emit(Event::OutgoingCallTimeout {
                peer_hash: outgoing.peer_hash,
                result: ErrorCode::NetworkError,
            });
        }
        self.state.starting_outgoing_call = false;

        for (peer_hash, incoming) in self.state.incoming_calls.drain() {
            self.emit(Event::IncomingCallExpired {
                peer_hash,
                peer_nickname: incoming.peer_nickname,
                result: ErrorCode::NetworkError,
            });
        }
        self.incoming_timers.clear();
        self.state.accept_in_flight = false;

        self.control = None;
        self.control_rx = None;
        self.media = None;
        self.media_rx = None;
        self.task_manager.cancel_all();
        self.pending.clear();

        self.state.connection = ConnectionState::Reconnecting;
        self.emit(Event::ConnectionDown);
        self.start_reconnect();
    }

    fn start_reconnect(&mut self) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.reconnect_cancel = Some(cancel_tx);
        let control_addr = self.control_addr.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = reconnect_loop(&control_addr, cancel_rx).await;
            let _ = internal_tx.send(Internal::Reconnected(outcome));
        });
    }

    async fn handle_control_packet(&mut self, packet: ControlPacket) {
        let body = packet.body;
        match packet.packet_type {
            PacketType::AuthorizationResult => self.on_authorization_result(body),
            PacketType::LogoutResult => self.on_logout_result(body),
            PacketType::ReconnectResult => self.on_reconnect_result(body).await,
            PacketType::GetUserInfoResult => self.on_get_user_info_result(body).await,
            PacketType::CallingBeginResult => self.on_calling_begin_result(body),
            PacketType::CallingEndResult => self.on_calling_end_result(body),
            PacketType::CallAcceptResult => self.on_call_accept_result(body),
            PacketType::CallDeclineResult => self.on_call_decline_result(body),
            PacketType::CallEndResult => self.on_call_end_result(body),
            PacketType::ScreenSharingBeginResult => self.on_sharing_begin_result(MediaKind::Screen, body),
            PacketType::ScreenSharingEndResult => self.on_sharing_end_result(MediaKind::Screen, body),
            PacketType::CameraSharingBeginResult => self.on_sharing_begin_result(MediaKind::Camera, body),
            PacketType::CameraSharingEndResult => self.on_sharing_end_result(MediaKind::Camera, body),

            PacketType::IncomingCall => self.on_incoming_call(body),
            PacketType::IncomingCallExpired => self.on_incoming_call_expired(body),
            // These three request types are reused for the server's forward to
            // the other party; a forward never carries a `uid` we registered
            // ourselves, so anything not found in `pending` is the mirror.
            PacketType::CallAccept => self.on_outgoing_call_accepted(body),
            PacketType::CallDecline => self.on_outgoing_call_declined(body),
            PacketType::CallEnd => self.on_call_ended_by_remote(body, ErrorCode::Success),
            PacketType::CallEndedByRemote => {
                let result = body.result.unwrap_or(ErrorCode::ConnectionDownWithUser);
                self.on_call_ended_by_remote(body, result)
            }
            PacketType::IncomingScreenSharingStarted => self.on_incoming_sharing_started(MediaKind::Screen, body),
            PacketType::IncomingScreenSharingStopped => self.on_incoming_sharing_stopped(MediaKind::Screen, body),
            PacketType::IncomingCameraSharingStarted => self.on_incoming_sharing_started(MediaKind::Camera, body),
            PacketType::IncomingCameraSharingStopped => self.on_incoming_sharing_stopped(MediaKind::Camera, body),

            PacketType::ConnectionDownWithUser => self.on_connection_down_with_user(body),
            PacketType::ConnectionRestoredWithUser => self.on_connection_restored_with_user(body),
            PacketType::UserLogout => self.on_user_logout(body),

            // Client-only request types never arrive inbound.
            PacketType::Authorization
            | PacketType::Logout
            | PacketType::Reconnect
            | PacketType::GetUserInfo
            | PacketType::CallingBegin
            | PacketType::ScreenSharingBegin
            | PacketType::ScreenSharingEnd
            | PacketType::CameraSharingBegin
            | PacketType::CameraSharingEnd => {
                tracing::warn!(?packet.packet_type, "dropping unexpected client-originated packet type");
            }
        }
    }

    fn take_pending(&mut self, body: &PacketBody) -> Option<PendingKind> {
        let uid = body.uid.as_deref()?;
        let kind = self.pending.remove(uid)?;
        self.task_manager.complete(uid);
        Some(kind)
    }

    fn on_authorization_result(&mut self, body: PacketBody) {
        let Some(PendingKind::Authorize) = self.take_pending(&body) else { return };
        let ok = body.result == Some(ErrorCode::Success);
        if ok {
            if let Some((nickname, nickname_hash, keypair)) = self.pending_identity.take() {
                self.state.identity = Some(Identity {
                    nickname,
                    nickname_hash,
                    token: body.token.unwrap_or_default(),
                    keypair,
                });
                self.state.connection = ConnectionState::Authorized(AuthorizedState::Up);
            }
            self.emit(Event::AuthorizationResult { result: ErrorCode::Success });
        } else {
            self.pending_identity = None;
            self.state.connection = ConnectionState::Unauthorized;
            self.control = None;
            self.control_rx = None;
            self.media = None;
            self.media_rx = None;
            self.emit(Event::AuthorizationResult {
                result: body.result.unwrap_or(ErrorCode::TakenNickname),
            });
        }
    }

    fn on_logout_result(&mut self, body: PacketBody) {
        if self.take_pending(&body).is_none() {
            return;
        }
        self.teardown_after_logout();
        self.emit(Event::LogoutCompleted);
    }

    async fn on_reconnect_result(&mut self, body: PacketBody) {
        let Some(PendingKind::Reconnect) = self.take_pending(&body) else { return };
        let ok = body.result == Some(ErrorCode::Success);
        if ok {
            self.state.connection = ConnectionState::Authorized(AuthorizedState::Up);
            self.emit(Event::ConnectionRestored);
            let is_active_call = body.is_active_call.unwrap_or(false);
            if !is_active_call {
                if let Some(active) = self.state.active_call.take() {
                    self.state.screen_sharing = SharingState::Stopped;
                    self.state.camera_sharing = SharingState::Stopped;
                    self.state.viewing_remote_screen = false;
                    self.emit(Event::CallEndedByRemote {
                        peer_hash: active.peer_hash,
                        result: ErrorCode::ConnectionDownWithUser,
                    });
                }
            }
        } else {
            self.state.connection = ConnectionState::Unauthorized;
            self.state.identity = None;
            self.state.clear_calls();
            self.control = None;
            self.control_rx = None;
            self.media = None;
            self.media_rx = None;
            self.emit(Event::ConnectionRestoredAuthorizationNeeded);
        }
    }

    async fn on_get_user_info_result(&mut self, body: PacketBody) {
        let Some(PendingKind::GetUserInfoForCall { peer_nickname, peer_hash }) = self.take_pending(&body) else {
            return;
        };
        let ok = body.result == Some(ErrorCode::Success);
        if !ok {
            self.state.starting_outgoing_call = false;
            self.emit(Event::StartOutgoingCallResult {
                peer_hash,
                result: body.result.unwrap_or(ErrorCode::UnexistingUser),
            });
            return;
        }
        let Some(identity) = self.state.identity.as_ref() else {
            self.state.starting_outgoing_call = false;
            return;
        };
        let Some(callee_public_key) = body
            .public_key
            .as_deref()
            .and_then(|s| crypto::deserialize_public_key(s).ok())
        else {
            self.state.starting_outgoing_call = false;
            self.emit(Event::StartOutgoingCallResult { peer_hash, result: ErrorCode::EncryptionError });
            return;
        };

        let call_key = SymmetricKey::generate();
        let packet_key = SymmetricKey::generate();
        let uid = crypto::generate_uid();
        let built = signalling::build_calling_begin_packet(
            &uid,
            &identity.token,
            &identity.nickname_hash,
            &peer_hash,
            &identity.keypair.public_key(),
            &identity.nickname,
            &callee_public_key,
            &call_key,
            &packet_key,
            self.media.as_ref().and_then(|m| m.local_port().ok()).unwrap_or(0),
        );
        let packet = match built {
            Ok(packet) => packet,
            Err(code) => {
                self.state.starting_outgoing_call = false;
                self.emit(Event::StartOutgoingCallResult { peer_hash, result: code });
                return;
            }
        };

        let kind = PendingKind::CallingBegin {
            peer_hash: peer_hash.clone(),
            peer_nickname,
            peer_public_key: callee_public_key,
            call_key,
        };
        if let Err(code) = self.send_tracked(uid, packet, kind) {
            self.state.starting_outgoing_call = false;
            self.emit(Event::StartOutgoingCallResult { peer_hash, result: code });
        }
    }

    fn on_calling_begin_result(&mut self, body: PacketBody) {
        let Some(PendingKind::CallingBegin { peer_hash, peer_nickname, peer_public_key, call_key }) =
            self.take_pending(&body)
        else {
            return;
        };
        self.state.starting_outgoing_call = false;
        let ok = body.result == Some(ErrorCode::Success);
        if ok {
            self.state.outgoing_call = Some(OutgoingCall {
                peer_nickname,
                peer_hash: peer_hash.clone(),
                peer_public_key,
                call_key,
            });
            self.start_outgoing_timer(peer_hash.clone());
        }
        self.emit(Event::StartOutgoingCallResult {
            peer_hash,
            result: body.result.unwrap_or(ErrorCode::NetworkError),
        });
    }

    fn on_calling_end_result(&mut self, body: PacketBody) {
        let Some(PendingKind::CallingEnd { peer_hash }) = self.take_pending(&body) else { return };
        self.emit(Event::StopOutgoingCallResult {
            peer_hash,
            result: body.result.unwrap_or(ErrorCode::NetworkError),
        });
    }

    fn on_call_accept_result(&mut self, body: PacketBody) {
        let Some(PendingKind::CallAccept { peer_hash, peer_nickname, peer_public_key, call_key }) =
            self.take_pending(&body)
        else {
            return;
        };
        self.state.accept_in_flight = false;
        let ok = body.result == Some(ErrorCode::Success);
        if ok {
            // The accepted offer's peer identity and call key were stashed
            // in the pending request at send time (spec §4.5 "the local
            // active call is installed on successful send"; §3 ActiveCall
            // "Created on accept (by either side)").
            self.state.active_call = Some(ActiveCall {
                peer_hash: peer_hash.clone(),
                peer_nickname,
                peer_public_key,
                call_key,
                peer_connection_down: false,
            });
            self.emit(Event::AcceptCallResult { peer_hash, result: ErrorCode::Success });
        } else {
            self.emit(Event::AcceptCallResult {
                peer_hash,
                result: body.result.unwrap_or(ErrorCode::NetworkError),
            });
        }
    }

    fn on_call_decline_result(&mut self, body: PacketBody) {
        let Some(PendingKind::CallDecline { peer_hash }) = self.take_pending(&body) else { return };
        self.emit(Event::DeclineCallResult {
            peer_hash,
            result: body.result.unwrap_or(ErrorCode::NetworkError),
        });
    }

    fn on_call_end_result(&mut self, body: PacketBody) {
        let Some(PendingKind::CallEnd { peer_hash }) = self.take_pending(&body) else { return };
        self.emit(Event::EndCallResult {
            peer_hash,
            result: body.result.unwrap_or(ErrorCode::NetworkError),
        });
    }

    fn on_sharing_begin_result(&mut self, kind: MediaKind, body: PacketBody) {
        let expected_begin = match kind {
            MediaKind::Screen => matches!(self.pending.get(body.uid.as_deref().unwrap_or("")), Some(PendingKind::ScreenSharingBegin)),
            MediaKind::Camera => matches!(self.pending.get(body.uid.as_deref().unwrap_or("")), Some(PendingKind::CameraSharingBegin)),
            MediaKind::Voice => false,
        };
        if !expected_begin || self.take_pending(&body).is_none() {
            return;
        }
        let ok = body.result == Some(ErrorCode::Success);
        match kind {
            MediaKind::Screen => {
                self.state.screen_sharing = if ok { SharingState::Active } else { SharingState::Stopped };
                self.emit(Event::StartScreenSharingResult { result: body.result.unwrap_or(ErrorCode::NetworkError) });
            }
            MediaKind::Camera => {
                self.state.camera_sharing = if ok { SharingState::Active } else { SharingState::Stopped };
                self.emit(Event::StartCameraSharingResult { result: body.result.unwrap_or(ErrorCode::NetworkError) });
            }
            MediaKind::Voice => unreachable!(),
        }
    }

    fn on_sharing_end_result(&mut self, kind: MediaKind, body: PacketBody) {
        let expected_end = match kind {
            MediaKind::Screen => matches!(self.pending.get(body.uid.as_deref().unwrap_or("")), Some(PendingKind::ScreenSharingEnd)),
            MediaKind::Camera => matches!(self.pending.get(body.uid.as_deref().unwrap_or("")), Some(PendingKind::CameraSharingEnd)),
            MediaKind::Voice => false,
        };
        if !expected_end || self.take_pending(&body).is_none() {
            return;
        }
        let ok = body.result == Some(ErrorCode::Success);
        match kind {
            MediaKind::Screen => {
                if ok {
                    self.state.screen_sharing = SharingState::Stopped;
                }
                self.emit(Event::StopScreenSharingResult { result: body.result.unwrap_or(ErrorCode::NetworkError) });
            }
            MediaKind::Camera => {
                if ok {
                    self.state.camera_sharing = SharingState::Stopped;
                }
                self.emit(Event::StopCameraSharingResult { result: body.result.unwrap_or(ErrorCode::NetworkError) });
            }
            MediaKind::Voice => unreachable!(),
        }
    }

    fn on_incoming_call(&mut self, body: PacketBody) {
        let sender_hash = body.sender_hash.clone().unwrap_or_default();
        if sender_hash.is_empty() || self.state.incoming_calls.contains_key(&sender_hash) {
            return;
        }
        let Some(identity) = self.state.identity.as_ref() else { return };
        match signalling::decode_calling_begin(&body, &identity.keypair) {
            Ok((peer_public_key, call_key, peer_nickname)) => {
                self.state.incoming_calls.insert(
                    sender_hash.clone(),
                    IncomingCall {
                        peer_nickname: peer_nickname.clone(),
                        peer_hash: sender_hash.clone(),
                        peer_public_key,
                        call_key,
                    },
                );
                self.start_incoming_timer(sender_hash.clone());
                self.emit(Event::IncomingCall { peer_hash: sender_hash, peer_nickname });
            }
            Err(_) => {
                tracing::warn!("dropping malformed incoming call offer");
            }
        }
    }

    fn on_incoming_call_expired(&mut self, body: PacketBody) {
        let sender_hash = body.sender_hash.clone().unwrap_or_default();
        let Some(incoming) = self.state.incoming_calls.remove(&sender_hash) else { return };
        self.cancel_incoming_timer(&sender_hash);
        self.emit(Event::IncomingCallExpired {
            peer_hash: sender_hash,
            peer_nickname: incoming.peer_nickname,
            result: body.result.unwrap_or(ErrorCode::Success),
        });
    }

    fn on_outgoing_call_accepted(&mut self, body: PacketBody) {
        if self.pending.contains_key(body.uid.as_deref().unwrap_or("")) {
            return;
        }
        let peer_hash = body.sender_hash.clone().unwrap_or_default();
        let Some(outgoing) = self.state.outgoing_call.take() else { return };
        if outgoing.peer_hash != peer_hash {
            self.state.outgoing_call = Some(outgoing);
            return;
        }
        self.cancel_outgoing_timer();
        self.state.active_call = Some(ActiveCall {
            peer_hash: outgoing.peer_hash.clone(),
            peer_nickname: outgoing.peer_nickname,
            peer_public_key: outgoing.peer_public_key,
            call_key: outgoing.call_key,
            peer_connection_down: false,
        });
        self.emit(Event::OutgoingCallAccepted { peer_hash });
    }

    fn on_outgoing_call_declined(&mut self, body: PacketBody) {
        if self.pending.contains_key(body.uid.as_deref().unwrap_or("")) {
            return;
        }
        let peer_hash = body.sender_hash.clone().unwrap_or_default();
        let Some(outgoing) = self.state.outgoing_call.take() else { return };
        if outgoing.peer_hash != peer_hash {
            self.state.outgoing_call = Some(outgoing);
            return;
        }
        self.cancel_outgoing_timer();
        self.emit(Event::OutgoingCallDeclined { peer_hash });
    }

    fn on_call_ended_by_remote(&mut self, body: PacketBody, result: ErrorCode) {
        if self.pending.contains_key(body.uid.as_deref().unwrap_or("")) {
            return;
        }
        let peer_hash = body.sender_hash.clone().unwrap_or_default();
        if !self.state.is_active_peer(&peer_hash) {
            return;
        }
        self.state.active_call = None;
        self.state.screen_sharing = SharingState::Stopped;
        self.state.camera_sharing = SharingState::Stopped;
        self.state.viewing_remote_screen = false;
        self.emit(Event::CallEndedByRemote { peer_hash, result });
    }

    fn on_incoming_sharing_started(&mut self, kind: MediaKind, body: PacketBody) {
        let peer_hash = body.sender_hash.clone().unwrap_or_default();
        if !self.state.is_active_peer(&peer_hash) {
            return;
        }
        match kind {
            MediaKind::Screen => {
                self.state.viewing_remote_screen = true;
                self.emit(Event::IncomingScreenSharingStarted { peer_hash });
            }
            MediaKind::Camera => self.emit(Event::IncomingCameraSharingStarted { peer_hash }),
            MediaKind::Voice => unreachable!(),
        }
    }

    fn on_incoming_sharing_stopped(&mut self, kind: MediaKind, body: PacketBody) {
        let peer_hash = body.sender_hash.clone().unwrap_or_default();
        if !self.state.is_active_peer(&peer_hash) {
            return;
        }
        match kind {
            MediaKind::Screen => {
                self.state.viewing_remote_screen = false;
                self.emit(Event::IncomingScreenSharingStopped { peer_hash });
            }
            MediaKind::Camera => self.emit(Event::IncomingCameraSharingStopped { peer_hash }),
            MediaKind::Voice => unreachable!(),
        }
    }

    fn on_connection_down_with_user(&mut self, body: PacketBody) {
        let peer_hash = body.sender_hash.clone().unwrap_or_default();
        if let Some(active) = self.state.active_call.as_mut() {
            if active.peer_hash == peer_hash {
                active.peer_connection_down = true;
                self.emit(Event::CallParticipantConnectionDown { peer_hash });
            }
        }
    }

    fn on_connection_restored_with_user(&mut self, body: PacketBody) {
        let peer_hash = body.sender_hash.clone().unwrap_or_default();
        if let Some(active) = self.state.active_call.as_mut() {
            if active.peer_hash == peer_hash {
                active.peer_connection_down = false;
                self.emit(Event::CallParticipantConnectionRestored { peer_hash });
            }
        }
    }

    fn on_user_logout(&mut self, body: PacketBody) {
        let peer_hash = body.sender_hash.clone().unwrap_or_default();

        if self.state.is_active_peer(&peer_hash) {
            self.state.active_call = None;
            self.state.screen_sharing = SharingState::Stopped;
            self.state.camera_sharing = SharingState::Stopped;
            self.state.viewing_remote_screen = false;
            self.emit(Event::CallEndedByRemote {
                peer_hash: peer_hash.clone(),
                result: ErrorCode::UserLogout,
            });
        }
        if let Some(incoming) = self.state.incoming_calls.remove(&peer_hash) {
            self.cancel_incoming_timer(&peer_hash);
            self.emit(Event::IncomingCallExpired {
                peer_hash: peer_hash.clone(),
                peer_nickname: incoming.peer_nickname,
                result: ErrorCode::UserLogout,
            });
        }
        if self.state.outgoing_call.as_ref().is_some_and(|o| o.peer_hash == peer_hash) {
            self.state.outgoing_call = None;
            self.cancel_outgoing_timer();
            self.emit(Event::OutgoingCallTimeout { peer_hash, result: ErrorCode::UserLogout });
        }
    }

    // ---- Media datagrams ----

    fn handle_media_datagram(&mut self, dg: MediaDatagram) {
        let Some(kind) = MediaKind::from_packet_type(dg.packet_type) else { return };
        let Some(active) = &self.state.active_call else { return };
        let Some(plaintext) = media_ops::decrypt_frame(&active.call_key, &dg.payload) else { return };
        match kind {
            MediaKind::Voice => {
                if let Some(engine) = &self.audio_engine {
                    engine.on_remote_frame(&plaintext);
                }
            }
            MediaKind::Screen => self.emit(Event::IncomingScreen { peer_hash: active.peer_hash.clone(), frame: plaintext }),
            MediaKind::Camera => self.emit(Event::IncomingCamera { peer_hash: active.peer_hash.clone(), frame: plaintext }),
        }
    }

    // ---- Internal signals ----

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::TaskExhausted(uid) => self.handle_task_exhausted(uid),
            Internal::OutgoingTimeout { peer_hash, seq } => self.handle_outgoing_timeout(peer_hash, seq),
            Internal::IncomingTimeout { peer_hash, seq } => self.handle_incoming_timeout(peer_hash, seq),
            Internal::Reconnected(outcome) => self.handle_reconnected(outcome).await,
        }
    }

    fn handle_task_exhausted(&mut self, uid: String) {
        let Some(kind) = self.pending.remove(&uid) else { return };
        match kind {
            PendingKind::Authorize => {
                self.pending_identity = None;
                self.state.connection = ConnectionState::Unauthorized;
                self.control = None;
                self.control_rx = None;
                self.media = None;
                self.media_rx = None;
                self.emit(Event::AuthorizationResult { result: ErrorCode::NetworkError });
            }
            PendingKind::Logout => {
                self.teardown_after_logout();
                self.emit(Event::LogoutCompleted);
            }
            PendingKind::GetUserInfoForCall { peer_hash, .. } => {
                self.state.starting_outgoing_call = false;
                self.emit(Event::StartOutgoingCallResult { peer_hash, result: ErrorCode::NetworkError });
            }
            PendingKind::CallingBegin { peer_hash, .. } => {
                self.state.starting_outgoing_call = false;
                self.emit(Event::StartOutgoingCallResult { peer_hash, result: ErrorCode::NetworkError });
            }
            PendingKind::CallingEnd { peer_hash } => {
                self.emit(Event::StopOutgoingCallResult { peer_hash, result: ErrorCode::NetworkError });
            }
            PendingKind::CallAccept { peer_hash, .. } => {
                self.state.accept_in_flight = false;
                self.emit(Event::AcceptCallResult { peer_hash, result: ErrorCode::NetworkError });
            }
            PendingKind::CallDecline { peer_hash } => {
                self.emit(Event::DeclineCallResult { peer_hash, result: ErrorCode::NetworkError });
            }
            PendingKind::CallEnd { peer_hash } => {
                self.emit(Event::EndCallResult { peer_hash, result: ErrorCode::NetworkError });
            }
            PendingKind::ScreenSharingBegin => {
                self.state.screen_sharing = SharingState::Stopped;
                self.emit(Event::StartScreenSharingResult { result: ErrorCode::NetworkError });
            }
            PendingKind::ScreenSharingEnd => {
                self.emit(Event::StopScreenSharingResult { result: ErrorCode::NetworkError });
            }
            PendingKind::CameraSharingBegin => {
                self.state.camera_sharing = SharingState::Stopped;
                self.emit(Event::StartCameraSharingResult { result: ErrorCode::NetworkError });
            }
            PendingKind::CameraSharingEnd => {
                self.emit(Event::StopCameraSharingResult { result: ErrorCode::NetworkError });
            }
            PendingKind::Reconnect => {
                // The TCP leg is up but RECONNECT itself never got acked;
                // the control transport is presumably wedged, so restart
                // the whole reconnect loop from scratch.
                self.control = None;
                self.control_rx = None;
                self.start_reconnect();
            }
        }
    }

    fn handle_outgoing_timeout(&mut self, peer_hash: String, seq: u64) {
        if self.outgoing_timer != Some((peer_hash.clone(), seq)) {
            return;
        }
        self.outgoing_timer = None;
        if self.state.outgoing_call.as_ref().is_some_and(|o| o.peer_hash == peer_hash) {
            self.state.outgoing_call = None;
            self.emit(Event::OutgoingCallTimeout { peer_hash, result: ErrorCode::Success });
        }
    }

    fn handle_incoming_timeout(&mut self, peer_hash: String, seq: u64) {
        if self.incoming_timers.get(&peer_hash) != Some(&seq) {
            return;
        }
        self.incoming_timers.remove(&peer_hash);
        if let Some(incoming) = self.state.incoming_calls.remove(&peer_hash) {
            self.emit(Event::IncomingCallExpired {
                peer_hash,
                peer_nickname: incoming.peer_nickname,
                result: ErrorCode::Success,
            });
        }
    }

    async fn handle_reconnected(&mut self, outcome: ReconnectOutcome) {
        let (transport, events) = match outcome {
            ReconnectOutcome::Cancelled => return,
            ReconnectOutcome::Connected { transport, events } => (transport, events),
        };
        self.control = Some(transport);
        self.control_rx = Some(events);

        let Some(identity) = self.state.identity.as_ref() else {
            self.state.connection = ConnectionState::Unauthorized;
            return;
        };

        let media = match MediaTransport::bind(self.media_addr).await {
            Ok((media, media_rx)) => {
                self.media_rx = Some(media_rx);
                media
            }
            Err(e) => {
                tracing::warn!(error = %e, "reconnect: media re-bind failed, will retry on next cycle");
                self.control = None;
                self.control_rx = None;
                self.start_reconnect();
                return;
            }
        };
        let udp_port = media.local_port().unwrap_or(0);
        self.media = Some(media);

        let uid = crypto::generate_uid();
        let packet = signalling::build_reconnect_packet(&uid, &identity.token, udp_port);
        let _ = self.send_tracked(uid, packet, PendingKind::Reconnect);
    }
}

trait IncomingCallClone {
    fn cloned_for_accept(self) -> Option<IncomingCall>;
}

impl IncomingCallClone for Option<&IncomingCall> {
    fn cloned_for_accept(self) -> Option<IncomingCall> {
        self.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, UdpSocket};

    async fn spawn_server() -> (TcpListener, UdpSocket) {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (tcp, udp)
    }

    #[tokio::test]
    async fn authorize_against_unreachable_server_reports_network_error() {
        let (handle, _events) = Client::spawn("127.0.0.1:1", "127.0.0.1:1".parse().unwrap(), None);
        let result = handle.authorize("alice").await;
        assert_eq!(result, ErrorCode::NetworkError);
    }

    #[tokio::test]
    async fn full_authorization_roundtrip_installs_identity_and_emits_success() {
        let (tcp, udp) = spawn_server().await;
        let tcp_addr = tcp.local_addr().unwrap();
        let udp_addr = udp.local_addr().unwrap();
        drop(udp);

        let server = tokio::spawn(async move {
            let (mut stream, _) = tcp.accept().await.unwrap();
            crate::wire::handshake_as_acceptor(&mut stream).await.unwrap();
            let (mut read_half, mut write_half) = tokio::io::split(stream);
            let packet = crate::wire::read_frame(&mut read_half).await.unwrap().unwrap();
            assert_eq!(packet.packet_type, PacketType::Authorization);
            crate::wire::write_frame(
                &mut write_half,
                &ControlPacket::new(
                    PacketType::AuthorizationResult,
                    PacketBody {
                        uid: packet.body.uid,
                        result: Some(ErrorCode::Success),
                        token: Some("tok-123".into()),
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap();
        });

        let (handle, mut events) = Client::spawn(tcp_addr.to_string(), udp_addr, None);
        let result = handle.authorize("alice").await;
        assert_eq!(result, ErrorCode::Success);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, Event::AuthorizationResult { result: ErrorCode::Success }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn start_outgoing_call_without_authorization_is_rejected_synchronously() {
        let (handle, _events) = Client::spawn("127.0.0.1:1", "127.0.0.1:2".parse().unwrap(), None);
        let result = handle.start_outgoing_call("bob").await;
        assert_eq!(result, ErrorCode::NotAuthorized);
    }

    #[tokio::test]
    async fn send_voice_frame_without_active_call_is_rejected() {
        let (handle, _events) = Client::spawn("127.0.0.1:1", "127.0.0.1:3".parse().unwrap(), None);
        let result = handle.send_voice_frame(vec![1, 2, 3]).await;
        assert_eq!(result, ErrorCode::NoActiveCall);
    }
}
