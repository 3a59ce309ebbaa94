//! Media engine capability contract.
//!
//! The engine owns capture, encoding and the ICE/DTLS/SRTP handshake. The
//! controller only asks it for descriptions, feeds it remote descriptions and
//! candidates, and listens to the events it reports. Events arrive as typed
//! messages on a channel created together with the engine, one engine per
//! session, never reused.

pub mod loopback;

use async_trait::async_trait;
use roomcall_common::config::{IceServerConfig, MediaConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Whether a description proposes or accepts a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled network-path candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// What to capture locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Fallback when the camera is denied or missing.
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_only()
    }
}

impl From<&MediaConfig> for MediaConstraints {
    fn from(cfg: &MediaConfig) -> Self {
        Self {
            audio: cfg.audio,
            video: cfg.video,
        }
    }
}

/// Handle to captured local media. Owned by exactly one session and handed back
/// to the engine by value when released, so it cannot be released twice.
#[derive(Debug, PartialEq, Eq)]
pub struct LocalMediaSource {
    pub id: Uuid,
    pub constraints: MediaConstraints,
}

impl LocalMediaSource {
    pub fn new(constraints: MediaConstraints) -> Self {
        Self {
            id: Uuid::new_v4(),
            constraints,
        }
    }

    /// Whether this capture includes a track of the given kind.
    pub fn has_track(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.constraints.audio,
            MediaKind::Video => self.constraints.video,
        }
    }
}

/// Kind of a captured local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// Reference to media delivered by the remote peer. The engine owns the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteMediaSource {
    pub id: String,
    pub audio: bool,
    pub video: bool,
}

/// Transport-level connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events the engine reports asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    CandidateDiscovered(IceCandidate),
    RemoteMedia(RemoteMediaSource),
    ConnectionStateChanged(ConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Microphone or camera denied or unavailable.
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Description rejected: {0}")]
    DescriptionRejected(String),

    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("Engine closed")]
    Closed,
}

/// Per-session wrapper around the platform's negotiation primitives.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaSource, EngineError>;

    /// Stop capture for a source previously returned by [`acquire_local_media`](Self::acquire_local_media).
    fn release_local_media(&self, source: LocalMediaSource);

    /// Enable or disable sending one kind of captured track without
    /// renegotiating. A disabled track keeps its slot in the description.
    async fn set_track_enabled(
        &self,
        source: &LocalMediaSource,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<(), EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    /// Discard a local offer that was never answered, returning the engine to
    /// a state where it can accept a remote offer instead.
    async fn rollback_local_description(&self) -> Result<(), EngineError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn close(&self);
}

/// Builds a fresh engine for every session.
pub trait MediaEngineFactory: Send + Sync {
    fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> (Box<dyn MediaEngine>, mpsc::UnboundedReceiver<EngineEvent>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_description_type_field() {
        let json = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(json["type"], "answer");
    }

    #[test]
    fn test_constraints_follow_media_config() {
        let cfg = MediaConfig {
            audio: true,
            video: true,
        };
        let constraints = MediaConstraints::from(&cfg);
        assert!(constraints.video);
        assert_eq!(MediaConstraints::default(), MediaConstraints::audio_only());
    }
}
