//! In-process media engine.
//!
//! Produces synthetic descriptions and host candidates, and reports
//! `connected` as soon as both descriptions are in place. It backs the demo
//! binary and the call-flow tests; the [`LoopbackProbe`] records what the
//! controller asked of it and lets tests inject engine events.

use super::{
    ConnectionState, EngineError, EngineEvent, IceCandidate, LocalMediaSource, MediaConstraints,
    MediaEngine, MediaKind, MediaEngineFactory, RemoteMediaSource, SdpType, SessionDescription,
};
use async_trait::async_trait;
use roomcall_common::config::IceServerConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Candidates emitted after each local description.
const CANDIDATES_PER_DESCRIPTION: usize = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fault injection knobs applied to every engine a factory builds.
#[derive(Debug, Clone)]
pub struct LoopbackFaults {
    /// Refuse any capture that includes video.
    pub deny_video: bool,
    /// Refuse all capture.
    pub deny_all: bool,
    /// Delay offer creation, to exercise teardown during negotiation.
    pub offer_delay: Option<Duration>,
    /// Delay capture, to exercise calls abandoned before they start.
    pub acquire_delay: Option<Duration>,
    /// Report `connected` once both descriptions are applied.
    pub auto_connect: bool,
}

impl Default for LoopbackFaults {
    fn default() -> Self {
        Self {
            deny_video: false,
            deny_all: false,
            offer_delay: None,
            acquire_delay: None,
            auto_connect: true,
        }
    }
}

/// Observation point into one loopback engine.
pub struct LoopbackProbe {
    label: String,
    events: mpsc::UnboundedSender<EngineEvent>,
    acquired: AtomicUsize,
    released: AtomicUsize,
    closed: AtomicUsize,
    connected: AtomicBool,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    discovered: Mutex<Vec<IceCandidate>>,
    applied: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<HashMap<MediaKind, bool>>,
    rollbacks: AtomicUsize,
}

impl LoopbackProbe {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.local).clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.remote).clone()
    }

    /// Candidates this engine trickled, in discovery order.
    pub fn discovered_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.discovered).clone()
    }

    /// Remote candidates applied to this engine, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.applied).clone()
    }

    /// Last enabled flag set for a track kind, `None` if never toggled.
    pub fn track_enabled(&self, kind: MediaKind) -> Option<bool> {
        lock(&self.tracks).get(&kind).copied()
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Inject a connection-state report as if the transport produced it.
    pub fn report(&self, state: ConnectionState) {
        let _ = self.events.send(EngineEvent::ConnectionStateChanged(state));
    }
}

/// Builds loopback engines and keeps their probes.
#[derive(Clone, Default)]
pub struct LoopbackEngineFactory {
    faults: LoopbackFaults,
    probes: Arc<Mutex<Vec<Arc<LoopbackProbe>>>>,
}

impl LoopbackEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: LoopbackFaults) -> Self {
        Self {
            faults,
            probes: Arc::default(),
        }
    }

    /// Probes of every engine built so far, oldest first.
    pub fn probes(&self) -> Vec<Arc<LoopbackProbe>> {
        lock(&self.probes).clone()
    }

    pub fn last_probe(&self) -> Option<Arc<LoopbackProbe>> {
        lock(&self.probes).last().cloned()
    }
}

impl MediaEngineFactory for LoopbackEngineFactory {
    fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> (Box<dyn MediaEngine>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let mut probes = lock(&self.probes);
        let probe = Arc::new(LoopbackProbe {
            label: format!("loopback-{}", probes.len() + 1),
            events,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            discovered: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            tracks: Mutex::new(HashMap::new()),
            rollbacks: AtomicUsize::new(0),
        });
        probes.push(probe.clone());

        tracing::debug!(
            engine = %probe.label,
            ice_servers = ice_servers.len(),
            "Loopback engine created"
        );

        let engine = LoopbackEngine {
            host: probes.len(),
            probe,
            faults: self.faults.clone(),
        };
        (Box::new(engine), rx)
    }
}

struct LoopbackEngine {
    host: usize,
    probe: Arc<LoopbackProbe>,
    faults: LoopbackFaults,
}

impl LoopbackEngine {
    fn sdp(&self, kind: SdpType) -> String {
        let setup = match kind {
            SdpType::Offer => "actpass",
            SdpType::Answer => "active",
        };
        format!(
            "v=0\r\no=- {host} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=setup:{setup}\r\n\
             a=ice-ufrag:{label}\r\n",
            host = self.host,
            label = self.probe.label,
        )
    }

    fn trickle(&self) {
        let mut discovered = lock(&self.probe.discovered);
        for _ in 0..CANDIDATES_PER_DESCRIPTION {
            let n = discovered.len() + 1;
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{n} 1 udp 2122260223 192.0.2.{host} {port} typ host ufrag {label}",
                    host = self.host,
                    port = 50_000 + n,
                    label = self.probe.label,
                ),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            };
            discovered.push(candidate.clone());
            let _ = self
                .probe
                .events
                .send(EngineEvent::CandidateDiscovered(candidate));
        }
    }

    fn maybe_connect(&self) {
        if !self.faults.auto_connect {
            return;
        }
        let ready = lock(&self.probe.local).is_some() && lock(&self.probe.remote).is_some();
        if ready && !self.probe.connected.swap(true, Ordering::SeqCst) {
            let events = &self.probe.events;
            let _ = events.send(EngineEvent::ConnectionStateChanged(
                ConnectionState::Connecting,
            ));
            let _ = events.send(EngineEvent::RemoteMedia(RemoteMediaSource {
                id: format!("{}-remote", self.probe.label),
                audio: true,
                video: false,
            }));
            let _ = events.send(EngineEvent::ConnectionStateChanged(
                ConnectionState::Connected,
            ));
        }
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaSource, EngineError> {
        if let Some(delay) = self.faults.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if self.faults.deny_all || (self.faults.deny_video && constraints.video) {
            return Err(EngineError::MediaUnavailable("permission denied".into()));
        }
        self.probe.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMediaSource::new(*constraints))
    }

    fn release_local_media(&self, _source: LocalMediaSource) {
        self.probe.released.fetch_add(1, Ordering::SeqCst);
    }

    async fn set_track_enabled(
        &self,
        source: &LocalMediaSource,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<(), EngineError> {
        if !source.has_track(kind) {
            return Err(EngineError::MediaUnavailable(format!("no {kind} track")));
        }
        lock(&self.probe.tracks).insert(kind, enabled);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        if let Some(delay) = self.faults.offer_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(SessionDescription::offer(self.sdp(SdpType::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if lock(&self.probe.remote).is_none() {
            return Err(EngineError::DescriptionRejected(
                "no remote offer to answer".into(),
            ));
        }
        Ok(SessionDescription::answer(self.sdp(SdpType::Answer)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        *lock(&self.probe.local) = Some(description);
        self.trickle();
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        if description.sdp.is_empty() {
            return Err(EngineError::DescriptionRejected("empty sdp".into()));
        }
        *lock(&self.probe.remote) = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<(), EngineError> {
        let mut local = lock(&self.probe.local);
        if !matches!(&*local, Some(d) if d.kind == SdpType::Offer) {
            return Err(EngineError::DescriptionRejected(
                "no local offer to roll back".into(),
            ));
        }
        *local = None;
        self.probe.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        if lock(&self.probe.remote).is_none() {
            return Err(EngineError::CandidateRejected(
                "no remote description".into(),
            ));
        }
        lock(&self.probe.applied).push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.probe.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connects_once_both_descriptions_are_set() {
        let factory = LoopbackEngineFactory::new();
        let (engine, mut events) = factory.create(&[]);

        let offer = engine.create_offer().await.unwrap();
        engine.set_local_description(offer).await.unwrap();
        engine
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();

        let mut states = Vec::new();
        let mut candidates = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::CandidateDiscovered(_) => candidates += 1,
                EngineEvent::ConnectionStateChanged(s) => states.push(s),
                EngineEvent::RemoteMedia(_) => {}
            }
        }
        assert_eq!(candidates, CANDIDATES_PER_DESCRIPTION);
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn test_denies_video_but_allows_audio_only() {
        let factory = LoopbackEngineFactory::with_faults(LoopbackFaults {
            deny_video: true,
            ..Default::default()
        });
        let (engine, _events) = factory.create(&[]);

        let video = MediaConstraints {
            audio: true,
            video: true,
        };
        assert!(matches!(
            engine.acquire_local_media(&video).await,
            Err(EngineError::MediaUnavailable(_))
        ));
        assert!(
            engine
                .acquire_local_media(&MediaConstraints::audio_only())
                .await
                .is_ok()
        );
        assert_eq!(factory.last_probe().unwrap().acquired_count(), 1);
    }

    #[tokio::test]
    async fn test_track_toggle_requires_captured_kind() {
        let factory = LoopbackEngineFactory::new();
        let (engine, _events) = factory.create(&[]);
        let media = engine
            .acquire_local_media(&MediaConstraints::audio_only())
            .await
            .unwrap();

        engine
            .set_track_enabled(&media, MediaKind::Audio, false)
            .await
            .unwrap();
        assert!(
            engine
                .set_track_enabled(&media, MediaKind::Video, false)
                .await
                .is_err()
        );

        let engine_state = factory.last_probe().unwrap();
        assert_eq!(engine_state.track_enabled(MediaKind::Audio), Some(false));
        assert_eq!(engine_state.track_enabled(MediaKind::Video), None);
    }

    #[tokio::test]
    async fn test_rollback_only_discards_local_offer() {
        let factory = LoopbackEngineFactory::new();
        let (engine, _events) = factory.create(&[]);
        assert!(engine.rollback_local_description().await.is_err());

        let offer = engine.create_offer().await.unwrap();
        engine.set_local_description(offer).await.unwrap();
        engine.rollback_local_description().await.unwrap();

        let engine_state = factory.last_probe().unwrap();
        assert!(engine_state.local_description().is_none());
        assert_eq!(engine_state.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_rejects_candidate_without_remote_description() {
        let factory = LoopbackEngineFactory::new();
        let (engine, _events) = factory.create(&[]);
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 192.0.2.9 9 typ host".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert!(engine.add_candidate(candidate).await.is_err());
    }
}
