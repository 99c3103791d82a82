//! Control packet types and the flat JSON body document they carry
//! (spec §4.4).

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Control channel packet discriminant. Values are stable across the
/// wire and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    Authorization = 2,
    AuthorizationResult = 3,
    Logout = 4,
    LogoutResult = 5,
    Reconnect = 6,
    ReconnectResult = 7,
    GetUserInfo = 8,
    GetUserInfoResult = 9,
    CallingBegin = 10,
    CallingBeginResult = 11,
    CallingEnd = 12,
    CallingEndResult = 13,
    IncomingCall = 14,
    IncomingCallExpired = 15,
    CallAccept = 16,
    CallAcceptResult = 17,
    CallDecline = 18,
    CallDeclineResult = 19,
    CallEnd = 20,
    CallEndResult = 21,
    CallEndedByRemote = 22,
    ScreenSharingBegin = 23,
    ScreenSharingBeginResult = 24,
    ScreenSharingEnd = 25,
    ScreenSharingEndResult = 26,
    IncomingScreenSharingStarted = 27,
    IncomingScreenSharingStopped = 28,
    CameraSharingBegin = 29,
    CameraSharingBeginResult = 30,
    CameraSharingEnd = 31,
    CameraSharingEndResult = 32,
    IncomingCameraSharingStarted = 33,
    IncomingCameraSharingStopped = 34,
    /// Sent by the server to every counterparty of a user whose media
    /// transport has gone silent (spec §4.7 "Connection-down on server").
    ConnectionDownWithUser = 35,
    /// Sent by the server to a call partner once the down user's RECONNECT
    /// has been accepted (spec §4.7, §4.8).
    ConnectionRestoredWithUser = 36,
    /// Sent to every counterparty of a user who logged out while holding a
    /// pending or active call with them (spec §4.7 LOGOUT handler).
    UserLogout = 37,
}

/// Media-plane datagram types (spec §4.4); these never cross the control
/// channel, only [`crate::wire::datagram`]. Types 0 and 1 are reserved for
/// the transport's own ping/pong keepalive.
pub const MEDIA_TYPE_VOICE: u32 = 100;
pub const MEDIA_TYPE_SCREEN: u32 = 101;
pub const MEDIA_TYPE_CAMERA: u32 = 102;

impl TryFrom<u32> for PacketType {
    type Error = crate::error::WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use PacketType::*;
        Ok(match value {
            2 => Authorization,
            3 => AuthorizationResult,
            4 => Logout,
            5 => LogoutResult,
            6 => Reconnect,
            7 => ReconnectResult,
            8 => GetUserInfo,
            9 => GetUserInfoResult,
            10 => CallingBegin,
            11 => CallingBeginResult,
            12 => CallingEnd,
            13 => CallingEndResult,
            14 => IncomingCall,
            15 => IncomingCallExpired,
            16 => CallAccept,
            17 => CallAcceptResult,
            18 => CallDecline,
            19 => CallDeclineResult,
            20 => CallEnd,
            21 => CallEndResult,
            22 => CallEndedByRemote,
            23 => ScreenSharingBegin,
            24 => ScreenSharingBeginResult,
            25 => ScreenSharingEnd,
            26 => ScreenSharingEndResult,
            27 => IncomingScreenSharingStarted,
            28 => IncomingScreenSharingStopped,
            29 => CameraSharingBegin,
            30 => CameraSharingBeginResult,
            31 => CameraSharingEnd,
            32 => CameraSharingEndResult,
            33 => IncomingCameraSharingStarted,
            34 => IncomingCameraSharingStopped,
            35 => ConnectionDownWithUser,
            36 => ConnectionRestoredWithUser,
            37 => UserLogout,
            other => return Err(crate::error::WireError::UnknownPacketType(other)),
        })
    }
}

/// The flat key-value document carried by every control packet. Not every
/// field is populated on every packet type; readers pull only the fields
/// their handler expects and report [`crate::error::WireError::MissingField`]
/// when a required one is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_call_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_encrypted_nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active_call: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
}

impl PacketBody {
    pub fn require_uid(&self) -> Result<&str, crate::error::WireError> {
        self.uid
            .as_deref()
            .ok_or(crate::error::WireError::MissingField("uid"))
    }

    pub fn require_token(&self) -> Result<&str, crate::error::WireError> {
        self.token
            .as_deref()
            .ok_or(crate::error::WireError::MissingField("token"))
    }

    pub fn require_nickname_hash(&self) -> Result<&str, crate::error::WireError> {
        self.nickname_hash
            .as_deref()
            .ok_or(crate::error::WireError::MissingField("nickname_hash"))
    }

    pub fn require_receiver_hash(&self) -> Result<&str, crate::error::WireError> {
        self.receiver_hash
            .as_deref()
            .ok_or(crate::error::WireError::MissingField("receiver_hash"))
    }
}

/// A fully decoded control-channel message.
#[derive(Debug, Clone)]
pub struct ControlPacket {
    pub packet_type: PacketType,
    pub body: PacketBody,
}

impl ControlPacket {
    pub fn new(packet_type: PacketType, body: PacketBody) -> Self {
        Self { packet_type, body }
    }
}
