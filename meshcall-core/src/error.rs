//! Client-facing error taxonomy (spec §7).

use serde::{Deserialize, Serialize};

/// The result code surfaced to the application, either as an immediate
/// precondition-check return value or via an observer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Success,
    NetworkError,
    TakenNickname,
    UnexistingUser,
    ConnectionDownWithUser,
    UserLogout,
    ConnectionDown,
    NotAuthorized,
    AlreadyAuthorized,
    OperationInProgress,
    ActiveCallExists,
    NoIncomingCall,
    NoOutgoingCall,
    NoActiveCall,
    ScreenSharingAlreadyActive,
    CameraSharingAlreadyActive,
    ScreenSharingNotActive,
    CameraSharingNotActive,
    ViewingRemoteScreen,
    EncryptionError,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Errors internal to the crypto surface (wrap/unwrap/encrypt/decrypt
/// failures). These never reach the application directly — callers map
/// them to [`ErrorCode::EncryptionError`].
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed key material")]
    InvalidKey,
    #[error("AEAD encryption failed")]
    EncryptFailed,
    #[error("AEAD decryption/authentication failed")]
    DecryptFailed,
    #[error("key derivation failed")]
    KdfFailed,
}

/// Errors from the wire codec (malformed frames, oversized bodies).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("body size {0} exceeds the maximum frame size")]
    BodyTooLarge(u32),
    #[error("malformed packet body: {0}")]
    MalformedBody(#[from] serde_json::Error),
    #[error("packet body is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown control packet type {0}")]
    UnknownPacketType(u32),
    #[error("datagram shorter than the fixed header")]
    DatagramTooShort,
}
