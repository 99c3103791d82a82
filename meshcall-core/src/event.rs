//! Observer events delivered to the application (spec §6).
//!
//! The client core never calls back into application code directly from
//! network-handling tasks; handlers construct an `Event` and send it over
//! an unbounded channel, and the application drains that channel (or
//! registers a listener closure) on its own time.

use crate::error::ErrorCode;

#[derive(Debug, Clone)]
pub enum Event {
    AuthorizationResult { result: ErrorCode },
    LogoutCompleted,

    StartOutgoingCallResult { peer_hash: String, result: ErrorCode },
    StopOutgoingCallResult { peer_hash: String, result: ErrorCode },
    OutgoingCallAccepted { peer_hash: String },
    OutgoingCallDeclined { peer_hash: String },
    OutgoingCallTimeout { peer_hash: String, result: ErrorCode },

    IncomingCall { peer_hash: String, peer_nickname: String },
    IncomingCallExpired { peer_hash: String, peer_nickname: String, result: ErrorCode },
    AcceptCallResult { peer_hash: String, result: ErrorCode },
    DeclineCallResult { peer_hash: String, result: ErrorCode },
    EndCallResult { peer_hash: String, result: ErrorCode },
    CallEndedByRemote { peer_hash: String, result: ErrorCode },

    StartScreenSharingResult { result: ErrorCode },
    StopScreenSharingResult { result: ErrorCode },
    StartCameraSharingResult { result: ErrorCode },
    StopCameraSharingResult { result: ErrorCode },

    IncomingScreenSharingStarted { peer_hash: String },
    IncomingScreenSharingStopped { peer_hash: String },
    IncomingCameraSharingStarted { peer_hash: String },
    IncomingCameraSharingStopped { peer_hash: String },
    IncomingScreen { peer_hash: String, frame: Vec<u8> },
    IncomingCamera { peer_hash: String, frame: Vec<u8> },

    ConnectionDown,
    ConnectionRestored,
    ConnectionRestoredAuthorizationNeeded,

    CallParticipantConnectionDown { peer_hash: String },
    CallParticipantConnectionRestored { peer_hash: String },
}
