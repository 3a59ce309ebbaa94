//! Error taxonomy for call control.
//!
//! [`CallError`] is returned to callers of the lifecycle manager.
//! [`ProtocolAnomaly`] describes a signal that was dropped; it is logged and
//! never propagated, so a misbehaving peer cannot crash the controller.

use crate::media::EngineError;
use crate::session::SessionState;
use crate::signal::SignalKind;
use crate::transport::TransportError;
use roomcall_common::{RoomId, SessionId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("A session with {remote} is already active in room {room}")]
    SessionAlreadyActive { room: RoomId, remote: String },

    /// The room was left, or an inbound call took precedence, while local
    /// media was still being acquired.
    #[error("Call in room {0} was abandoned before it started")]
    Abandoned(RoomId),

    #[error("Could not acquire local media: {0}")]
    MediaAcquisition(#[source] EngineError),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[source] EngineError),

    #[error("Signaling transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session {0} not found")]
    UnknownSession(SessionId),

    #[error("Session {0} has no incoming offer to answer")]
    NotAwaitingAnswer(SessionId),

    #[error("Could not encode signal payload: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type CallResult<T> = Result<T, CallError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolAnomaly {
    #[error("Malformed {kind} payload from {sender}: {reason}")]
    MalformedPayload {
        kind: SignalKind,
        sender: UserId,
        reason: String,
    },

    #[error("No session for {kind} from {sender}")]
    NoSession { kind: SignalKind, sender: UserId },

    #[error("Duplicate offer from {sender}")]
    DuplicateOffer { sender: UserId },

    #[error("Unexpected {kind} from {sender} in state {state}")]
    UnexpectedSignal {
        kind: SignalKind,
        sender: UserId,
        state: SessionState,
    },

    #[error("Answer from {sender} does not match the outstanding offer")]
    StaleAnswer { sender: UserId },

    #[error("Candidate from {sender} belongs to an earlier negotiation")]
    StaleCandidate { sender: UserId },

    #[error("Offer from {sender} lost the glare tie-break")]
    GlareLost { sender: UserId },
}
