//! Signaling messages exchanged over the room channel.
//!
//! Every message carries its sender and an addressee, which is either one
//! identity or the room-wide wildcard `"all"`. The payload is opaque on the
//! wire; typed accessors decode it per kind:
//! - `offer` / `answer`: [`DescriptionPayload`]
//! - `candidate`: [`CandidatePayload`]
//!
//! Media itself never flows through this channel.

use crate::error::ProtocolAnomaly;
use crate::media::{IceCandidate, SdpType, SessionDescription};
use roomcall_common::UserId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wire value of the room-wide wildcard receiver. Reserved: a participant
/// named `all` cannot be addressed directly.
pub const WILDCARD: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    #[serde(alias = "ice-candidate")]
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
        };
        f.write_str(s)
    }
}

/// Addressee of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    /// Any current room member other than the sender.
    All,
    User(UserId),
}

impl Recipient {
    pub fn includes(&self, user: &UserId) -> bool {
        match self {
            Self::All => true,
            Self::User(id) => id == user,
        }
    }
}

impl From<Option<UserId>> for Recipient {
    fn from(user: Option<UserId>) -> Self {
        user.map_or(Self::All, Self::User)
    }
}

/// The reserved [`WILDCARD`] always decodes to [`Recipient::All`], never to a
/// user of that name.
impl From<String> for Recipient {
    fn from(s: String) -> Self {
        if s == WILDCARD {
            Self::All
        } else {
            Self::User(UserId::from(s))
        }
    }
}

impl From<Recipient> for String {
    fn from(r: Recipient) -> Self {
        match r {
            Recipient::All => WILDCARD.to_owned(),
            Recipient::User(id) => id.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(WILDCARD),
            Self::User(id) => id.fmt(f),
        }
    }
}

/// Identifier of one offer/answer round. Generated with the offer and echoed
/// by the answer and by every candidate trickled during that round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NegotiationId(Uuid);

impl NegotiationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NegotiationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Payload of `offer` and `answer` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionPayload {
    #[serde(flatten)]
    pub description: SessionDescription,
    pub negotiation: NegotiationId,
}

/// Payload of `candidate` messages. `negotiation` is absent from legacy peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    #[serde(flatten)]
    pub candidate: IceCandidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation: Option<NegotiationId>,
}

/// Transport payload: `{ kind, sender, receiver, payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub kind: SignalKind,
    pub sender: UserId,
    pub receiver: Recipient,
    pub payload: serde_json::Value,
}

impl SignalMessage {
    pub fn new(
        kind: SignalKind,
        sender: UserId,
        receiver: Recipient,
        payload: &impl Serialize,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            sender,
            receiver,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode an `offer`/`answer` payload, checking the description type matches the kind.
    pub fn description(&self) -> Result<DescriptionPayload, ProtocolAnomaly> {
        let expected = match self.kind {
            SignalKind::Offer => SdpType::Offer,
            SignalKind::Answer => SdpType::Answer,
            SignalKind::Candidate => {
                return Err(self.malformed("candidate carries no description"));
            }
        };
        let payload: DescriptionPayload = self.decode()?;
        if payload.description.kind != expected {
            return Err(self.malformed("description type does not match message kind"));
        }
        Ok(payload)
    }

    pub fn candidate(&self) -> Result<CandidatePayload, ProtocolAnomaly> {
        if self.kind != SignalKind::Candidate {
            return Err(self.malformed("not a candidate message"));
        }
        self.decode()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolAnomaly> {
        serde_json::from_value(self.payload.clone()).map_err(|e| self.malformed(&e.to_string()))
    }

    fn malformed(&self, reason: &str) -> ProtocolAnomaly {
        ProtocolAnomaly::MalformedPayload {
            kind: self.kind,
            sender: self.sender.clone(),
            reason: reason.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer_payload() -> DescriptionPayload {
        DescriptionPayload {
            description: SessionDescription::offer("v=0\r\n"),
            negotiation: NegotiationId::generate(),
        }
    }

    #[test]
    fn test_wire_shape() {
        let msg = SignalMessage::new(
            SignalKind::Offer,
            UserId::from("alice"),
            Recipient::All,
            &offer_payload(),
        )
        .unwrap();
        let wire: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(wire["kind"], "offer");
        assert_eq!(wire["sender"], "alice");
        assert_eq!(wire["receiver"], "all");
        assert_eq!(wire["payload"]["type"], "offer");
        assert_eq!(wire["payload"]["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_parses_legacy_candidate_kind() {
        let text = json!({
            "kind": "ice-candidate",
            "sender": "bob",
            "receiver": "alice",
            "payload": {
                "candidate": "candidate:1 1 udp 2122260223 192.0.2.2 50001 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        })
        .to_string();

        let msg = SignalMessage::from_json(&text).unwrap();
        assert_eq!(msg.kind, SignalKind::Candidate);
        assert_eq!(msg.receiver, Recipient::User(UserId::from("alice")));

        let payload = msg.candidate().unwrap();
        assert_eq!(payload.negotiation, None);
        assert_eq!(payload.candidate.sdp_mid.as_deref(), Some("0"));
    }

    #[test]
    fn test_rejects_mismatched_description_type() {
        let msg = SignalMessage::new(
            SignalKind::Answer,
            UserId::from("alice"),
            Recipient::All,
            &offer_payload(),
        )
        .unwrap();
        assert!(matches!(
            msg.description(),
            Err(ProtocolAnomaly::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_rejects_garbage_payload() {
        let msg = SignalMessage {
            kind: SignalKind::Offer,
            sender: UserId::from("mallory"),
            receiver: Recipient::All,
            payload: json!("not a description"),
        };
        assert!(msg.description().is_err());
    }

    #[test]
    fn test_recipient_includes() {
        let alice = UserId::from("alice");
        assert!(Recipient::All.includes(&alice));
        assert!(Recipient::User(alice.clone()).includes(&alice));
        assert!(!Recipient::User(UserId::from("carol")).includes(&alice));
        assert_eq!(Recipient::from(None), Recipient::All);
    }

    #[test]
    fn test_user_named_all_is_the_wildcard() {
        let recipient = Recipient::from(Some(UserId::from(WILDCARD)));
        let wire = String::from(recipient);
        assert_eq!(Recipient::from(wire), Recipient::All);
    }
}
