//! Per-connection control-channel handler (spec §4.7): one task per
//! accepted TCP connection, split into a read loop that dispatches framed
//! requests into the [`Registry`](crate::registry::Registry) and a writer
//! task draining whatever replies/forwards land on this connection's
//! channel — grounded on `freeq-server`'s `connection::handle_io` (mpsc
//! fan-in registered into a shared connection map, dedicated writer task).
//! No line-oriented rate limiting here: that guarded against IRC command
//! flooding and has no counterpart in this protocol.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use meshcall_core::wire::{read_frame, write_frame, ControlPacket, PacketBody, PacketType};
use meshcall_core::ErrorCode;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::registry::{PacketTx, ReconnectOutcome};
use crate::server::SharedState;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Accept and run one client connection until it disconnects.
pub async fn handle(mut stream: TcpStream, state: Arc<SharedState>) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::debug!(error = %e, "could not read peer address");
            return;
        }
    };

    if let Err(e) = meshcall_core::wire::handshake_as_acceptor(&mut stream).await {
        tracing::debug!(error = %e, peer = %peer_addr, "handshake failed");
        return;
    }

    let (read_half, mut write_half) = stream.into_split();
    let (self_tx, mut self_rx) = mpsc::channel::<ControlPacket>(WRITER_CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(packet) = self_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &packet).await {
                tracing::debug!(error = %e, "control write failed");
                break;
            }
        }
    });

    let mut reader = read_half;
    let mut current_hash: Option<String> = None;
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(packet)) => {
                dispatch(packet, &mut current_hash, peer_addr.ip(), &state, &self_tx).await;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, peer = %peer_addr, "control read error");
                break;
            }
        }
    }

    // A connection that lost the race against a concurrent RECONNECT on a
    // fresh socket must not mark the (now-current) connection down.
    if let Some(hash) = current_hash {
        if state.registry.owns_connection(&hash, &self_tx) {
            crate::server::mark_down_and_arm_grace(state, hash).await;
        }
    }

    // `writer` exits once every clone of `self_tx` — ours and whatever the
    // registry still holds for this user — is dropped; it's left to finish
    // on its own rather than aborted, since a stale registry entry during a
    // grace period is the only thing keeping it alive and that's bounded.
    drop(writer);
}

fn reply(uid: Option<String>, packet_type: PacketType, result: ErrorCode) -> ControlPacket {
    ControlPacket::new(packet_type, PacketBody { uid, result: Some(result), ..Default::default() })
}

async fn deliver(tx: &PacketTx, packet: ControlPacket) {
    let _ = tx.send(packet).await;
}

async fn fan_out(notifies: Vec<crate::registry::Notify>) {
    for notify in notifies {
        let _ = notify.tx.send(notify.packet).await;
    }
}

async fn dispatch(
    packet: ControlPacket,
    current_hash: &mut Option<String>,
    peer_ip: IpAddr,
    state: &Arc<SharedState>,
    self_tx: &PacketTx,
) {
    let body = packet.body;
    let registry = &state.registry;

    match packet.packet_type {
        PacketType::Authorization => {
            let uid = body.uid.clone();
            let (Some(nickname_hash), Some(public_key)) = (body.nickname_hash.clone(), body.public_key.clone())
            else {
                deliver(self_tx, reply(uid, PacketType::AuthorizationResult, ErrorCode::NetworkError)).await;
                return;
            };
            let media_addr = SocketAddr::new(peer_ip, body.udp_port.unwrap_or(0));
            match registry.authorize(&nickname_hash, public_key, media_addr, self_tx.clone()) {
                Ok(token) => {
                    *current_hash = Some(nickname_hash);
                    let packet = ControlPacket::new(
                        PacketType::AuthorizationResult,
                        PacketBody {
                            uid,
                            token: Some(token),
                            result: Some(ErrorCode::Success),
                            ..Default::default()
                        },
                    );
                    deliver(self_tx, packet).await;
                }
                Err(code) => deliver(self_tx, reply(uid, PacketType::AuthorizationResult, code)).await,
            }
        }

        PacketType::Logout => {
            let uid = body.uid.clone();
            let Some(token) = body.token.clone() else {
                deliver(self_tx, reply(uid, PacketType::LogoutResult, ErrorCode::NetworkError)).await;
                return;
            };
            match registry.logout(&token) {
                Ok(notifies) => {
                    deliver(self_tx, reply(uid, PacketType::LogoutResult, ErrorCode::Success)).await;
                    fan_out(notifies).await;
                    *current_hash = None;
                }
                Err(code) => deliver(self_tx, reply(uid, PacketType::LogoutResult, code)).await,
            }
        }

        PacketType::Reconnect => {
            let uid = body.uid.clone();
            let Some(token) = body.token.clone() else {
                deliver(self_tx, reply(uid, PacketType::ReconnectResult, ErrorCode::NetworkError)).await;
                return;
            };
            let Some(hash) = registry.resolve_hash(&token) else {
                deliver(self_tx, reply(uid, PacketType::ReconnectResult, ErrorCode::NotAuthorized)).await;
                return;
            };
            let media_addr = SocketAddr::new(peer_ip, body.udp_port.unwrap_or(0));
            match registry.reconnect(&hash, &token, media_addr, self_tx.clone()) {
                ReconnectOutcome::Accepted { is_active_call, restored_notify } => {
                    *current_hash = Some(hash);
                    let packet = ControlPacket::new(
                        PacketType::ReconnectResult,
                        PacketBody {
                            uid,
                            result: Some(ErrorCode::Success),
                            is_active_call: Some(is_active_call),
                            ..Default::default()
                        },
                    );
                    deliver(self_tx, packet).await;
                    if let Some(notify) = restored_notify {
                        let _ = notify.tx.send(notify.packet).await;
                    }
                }
                ReconnectOutcome::Rejected => {
                    deliver(self_tx, reply(uid, PacketType::ReconnectResult, ErrorCode::NotAuthorized)).await;
                }
            }
        }

        PacketType::GetUserInfo => {
            let uid = body.uid.clone();
            let (Some(token), Some(target_hash)) = (body.token.clone(), body.nickname_hash.clone()) else {
                deliver(self_tx, reply(uid, PacketType::GetUserInfoResult, ErrorCode::NetworkError)).await;
                return;
            };
            match registry.get_user_info(&token, &target_hash) {
                Ok(public_key) => {
                    let packet = ControlPacket::new(
                        PacketType::GetUserInfoResult,
                        PacketBody {
                            uid,
                            public_key: Some(public_key),
                            result: Some(ErrorCode::Success),
                            ..Default::default()
                        },
                    );
                    deliver(self_tx, packet).await;
                }
                Err(code) => deliver(self_tx, reply(uid, PacketType::GetUserInfoResult, code)).await,
            }
        }

        PacketType::CallingBegin => {
            let uid = body.uid.clone();
            let Some(token) = body.token.clone() else {
                deliver(self_tx, reply(uid, PacketType::CallingBeginResult, ErrorCode::NetworkError)).await;
                return;
            };
            let Some(receiver_hash) = body.receiver_hash.clone() else {
                deliver(self_tx, reply(uid, PacketType::CallingBeginResult, ErrorCode::NetworkError)).await;
                return;
            };
            let Some(initiator_hash) = registry.resolve_hash(&token) else {
                deliver(self_tx, reply(uid, PacketType::CallingBeginResult, ErrorCode::NotAuthorized)).await;
                return;
            };
            match registry.start_calling(&initiator_hash, &receiver_hash) {
                Ok((pending_id, call_token, target)) => {
                    deliver(self_tx, reply(uid, PacketType::CallingBeginResult, ErrorCode::Success)).await;
                    if let Some(target) = target {
                        let mut forward = body.clone();
                        forward.uid = None;
                        forward.token = None;
                        let _ = target.tx.send(ControlPacket::new(PacketType::IncomingCall, forward)).await;
                    }
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(
                            meshcall_core::signalling::PENDING_CALL_TIMEOUT_SECS,
                        ))
                        .await;
                        registry.expire_pending_call(pending_id, call_token);
                    });
                }
                Err(code) => deliver(self_tx, reply(uid, PacketType::CallingBeginResult, code)).await,
            }
        }

        PacketType::CallingEnd => {
            let uid = body.uid.clone();
            let (Some(token), Some(receiver_hash)) = (body.token.clone(), body.receiver_hash.clone()) else {
                deliver(self_tx, reply(uid, PacketType::CallingEndResult, ErrorCode::NetworkError)).await;
                return;
            };
            let Some(initiator_hash) = registry.resolve_hash(&token) else {
                deliver(self_tx, reply(uid, PacketType::CallingEndResult, ErrorCode::NotAuthorized)).await;
                return;
            };
            match registry.calling_end(&initiator_hash, &receiver_hash) {
                Ok(notify) => {
                    deliver(self_tx, reply(uid, PacketType::CallingEndResult, ErrorCode::Success)).await;
                    if let Some(notify) = notify {
                        let _ = notify.tx.send(notify.packet).await;
                    }
                }
                Err(code) => deliver(self_tx, reply(uid, PacketType::CallingEndResult, code)).await,
            }
        }

        PacketType::CallAccept => {
            let uid = body.uid.clone();
            let (Some(token), Some(initiator_hash)) = (body.token.clone(), body.receiver_hash.clone()) else {
                deliver(self_tx, reply(uid, PacketType::CallAcceptResult, ErrorCode::NetworkError)).await;
                return;
            };
            let Some(accepter_hash) = registry.resolve_hash(&token) else {
                deliver(self_tx, reply(uid, PacketType::CallAcceptResult, ErrorCode::NotAuthorized)).await;
                return;
            };
            match registry.call_accept(&accepter_hash, &initiator_hash) {
                Ok(mut notify) => {
                    // Re-forward the re-wrapped call key from the original
                    // request so the initiator recovers it even if it lost
                    // its own copy (spec §3 "Call keys").
                    notify.packet.body.encrypted_call_key = body.encrypted_call_key.clone();
                    deliver(self_tx, reply(uid, PacketType::CallAcceptResult, ErrorCode::Success)).await;
                    let _ = notify.tx.send(notify.packet).await;
                }
                Err(code) => deliver(self_tx, reply(uid, PacketType::CallAcceptResult, code)).await,
            }
        }

        PacketType::CallDecline => {
            let uid = body.uid.clone();
            let (Some(token), Some(initiator_hash)) = (body.token.clone(), body.receiver_hash.clone()) else {
                deliver(self_tx, reply(uid, PacketType::CallDeclineResult, ErrorCode::NetworkError)).await;
                return;
            };
            let Some(decliner_hash) = registry.resolve_hash(&token) else {
                deliver(self_tx, reply(uid, PacketType::CallDeclineResult, ErrorCode::NotAuthorized)).await;
                return;
            };
            match registry.call_decline(&decliner_hash, &initiator_hash) {
                Ok(notify) => {
                    deliver(self_tx, reply(uid, PacketType::CallDeclineResult, ErrorCode::Success)).await;
                    if let Some(notify) = notify {
                        let _ = notify.tx.send(notify.packet).await;
                    }
                }
                Err(code) => deliver(self_tx, reply(uid, PacketType::CallDeclineResult, code)).await,
            }
        }

        PacketType::CallEnd => {
            let uid = body.uid.clone();
            let (Some(token), Some(peer_hash)) = (body.token.clone(), body.receiver_hash.clone()) else {
                deliver(self_tx, reply(uid, PacketType::CallEndResult, ErrorCode::NetworkError)).await;
                return;
            };
            let Some(ender_hash) = registry.resolve_hash(&token) else {
                deliver(self_tx, reply(uid, PacketType::CallEndResult, ErrorCode::NotAuthorized)).await;
                return;
            };
            match registry.call_end(&ender_hash, &peer_hash) {
                Ok(notify) => {
                    deliver(self_tx, reply(uid, PacketType::CallEndResult, ErrorCode::Success)).await;
                    if let Some(notify) = notify {
                        let _ = notify.tx.send(notify.packet).await;
                    }
                }
                Err(code) => deliver(self_tx, reply(uid, PacketType::CallEndResult, code)).await,
            }
        }

        PacketType::ScreenSharingBegin => {
            handle_sharing_toggle(
                state,
                self_tx,
                &body,
                PacketType::ScreenSharingBeginResult,
                PacketType::IncomingScreenSharingStarted,
            )
            .await
        }
        PacketType::ScreenSharingEnd => {
            handle_sharing_toggle(
                state,
                self_tx,
                &body,
                PacketType::ScreenSharingEndResult,
                PacketType::IncomingScreenSharingStopped,
            )
            .await
        }
        PacketType::CameraSharingBegin => {
            handle_sharing_toggle(
                state,
                self_tx,
                &body,
                PacketType::CameraSharingBeginResult,
                PacketType::IncomingCameraSharingStarted,
            )
            .await
        }
        PacketType::CameraSharingEnd => {
            handle_sharing_toggle(
                state,
                self_tx,
                &body,
                PacketType::CameraSharingEndResult,
                PacketType::IncomingCameraSharingStopped,
            )
            .await
        }

        other => {
            tracing::warn!(?other, "ignoring server-originated packet type from client");
        }
    }
}

/// SCREEN/CAMERA_SHARING_BEGIN/END (spec §4.7): carry no registry state of
/// their own, only a forward to whoever is on the other end of the active
/// call, gated on `receiver_hash` actually being that partner.
async fn handle_sharing_toggle(
    state: &Arc<SharedState>,
    self_tx: &PacketTx,
    body: &PacketBody,
    result_type: PacketType,
    forward_type: PacketType,
) {
    let uid = body.uid.clone();
    let (Some(token), Some(peer_hash)) = (body.token.clone(), body.receiver_hash.clone()) else {
        deliver(self_tx, reply(uid, result_type, ErrorCode::NetworkError)).await;
        return;
    };
    let Some(sender_hash) = state.registry.resolve_hash(&token) else {
        deliver(self_tx, reply(uid, result_type, ErrorCode::NotAuthorized)).await;
        return;
    };
    match state.registry.active_partner(&sender_hash) {
        Ok(partner) if partner.hash == peer_hash => {
            deliver(self_tx, reply(uid, result_type, ErrorCode::Success)).await;
            let forward = ControlPacket::new(
                forward_type,
                PacketBody { sender_hash: Some(sender_hash), ..Default::default() },
            );
            let _ = partner.tx.send(forward).await;
        }
        Ok(_) => deliver(self_tx, reply(uid, result_type, ErrorCode::NoActiveCall)).await,
        Err(code) => deliver(self_tx, reply(uid, result_type, code)).await,
    }
}
