//! Peer sessions and the negotiation state machine.
//!
//! Each session is owned by a single task (the [`Negotiator`]) that consumes
//! routed signals, user commands and engine events from channels, one at a
//! time. Nothing else touches session state; the outside world observes it
//! through a [`SessionHandle`].
//!
//! ```text
//!   idle ──initiate──▶ negotiating-offer ──answer applied──┐
//!   idle ──offer+accept──▶ negotiating-answer ─────────────┤
//!   negotiating-offer ──crossed offer, polite──▶ negotiating-answer
//!                                                          ▼
//!                             engine reports connected ▶ connected
//!   any ──engine disconnected / failed──▶ disconnected / failed ──▶ closed
//!   any ──teardown──▶ closed (terminal)
//! ```
//!
//! Teardown is observed through a [`CancellationToken`]: every engine call is
//! raced against it, and a result that arrives after cancellation is dropped.

use crate::candidates::{Admission, CandidateQueue};
use crate::error::{CallError, ProtocolAnomaly};
use crate::media::{
    ConnectionState, EngineError, EngineEvent, LocalMediaSource, MediaConstraints, MediaEngine,
    MediaKind, RemoteMediaSource, SessionDescription,
};
use crate::signal::{
    CandidatePayload, DescriptionPayload, NegotiationId, Recipient, SignalKind, SignalMessage,
};
use crate::transport::SignalingTransport;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use roomcall_common::{RoomId, SessionId, UserId};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    NegotiatingOffer,
    NegotiatingAnswer,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    /// The session will not negotiate again.
    pub fn is_ended(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::NegotiatingOffer => "negotiating-offer",
            Self::NegotiatingAnswer => "negotiating-answer",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub room_id: RoomId,
    pub local_user: UserId,
    /// `None` until the first answer resolves who picked up a wildcard call.
    pub remote_user: Option<UserId>,
    pub state: SessionState,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub pending_candidates: usize,
    /// An inbound offer is waiting for `answer_incoming`.
    pub incoming_offer: bool,
    pub has_local_media: bool,
    /// Local audio is being sent. Cleared by muting.
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub remote_media: Option<RemoteMediaSource>,
    pub created_at: DateTime<Utc>,
}

/// Notifications delivered on a session's [`SessionEvents`] stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    RemoteMedia(RemoteMediaSource),
}

/// Stream of a session's events. Ends right after the transition to `closed`.
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Caller-side reference to a session. Cheap to clone; stays readable after
/// the session has closed.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    room_id: RoomId,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: Arc<Mutex<Option<SessionEvents>>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// Take the event stream. Only the first call across all clones gets it.
    pub fn events(&self) -> Option<SessionEvents> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait until the session reaches `state`. Returns `None` if the session
    /// finished without ever reaching it.
    pub async fn wait_for_state(&self, state: SessionState) -> Option<SessionSnapshot> {
        self.wait_for(|snapshot| snapshot.state == state).await
    }

    /// Wait for a snapshot matching `predicate`, checking the current one first.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Option<SessionSnapshot> {
        let mut rx = self.snapshot.clone();
        match rx.wait_for(predicate).await {
            Ok(snapshot) => Some(snapshot.clone()),
            Err(_) => None,
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Commands delivered to a session task.
#[derive(Debug)]
pub(crate) enum SessionInput {
    /// Create and broadcast an offer.
    Initiate,
    /// A routed signal from the session's remote peer.
    Signal(SignalMessage),
    /// Answer the stored inbound offer, capturing media first if needed.
    Accept(MediaConstraints),
    /// Start or stop sending one kind of local track.
    SetTrackEnabled { kind: MediaKind, enabled: bool },
}

/// State transitions reported to the lifecycle manager.
#[derive(Debug, Clone)]
pub(crate) struct StateReport {
    pub session: SessionId,
    pub state: SessionState,
}

/// Mutable state of one peer session.
struct PeerSession {
    id: SessionId,
    room_id: RoomId,
    local_user: UserId,
    remote_user: Option<UserId>,
    state: SessionState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    candidates: CandidateQueue,
    local_media: Option<LocalMediaSource>,
    audio_enabled: bool,
    video_enabled: bool,
    remote_media: Option<RemoteMediaSource>,
    negotiation: Option<NegotiationId>,
    pending_offer: Option<DescriptionPayload>,
    created_at: DateTime<Utc>,
}

impl PeerSession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            room_id: self.room_id.clone(),
            local_user: self.local_user.clone(),
            remote_user: self.remote_user.clone(),
            state: self.state,
            local_description: self.local_description.clone(),
            remote_description: self.remote_description.clone(),
            pending_candidates: self.candidates.len(),
            incoming_offer: self.pending_offer.is_some(),
            has_local_media: self.local_media.is_some(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            remote_media: self.remote_media.clone(),
            created_at: self.created_at,
        }
    }
}

pub(crate) struct SessionParams {
    pub room_id: RoomId,
    pub local_user: UserId,
    pub remote_user: Option<UserId>,
    pub engine: Box<dyn MediaEngine>,
    pub local_media: Option<LocalMediaSource>,
    /// Inbound offer this session was created for.
    pub offer: Option<DescriptionPayload>,
    pub transport: Arc<dyn SignalingTransport>,
    pub reports: mpsc::UnboundedSender<StateReport>,
    /// Resolve crossed offers by identity order.
    pub polite_tie_break: bool,
}

/// What the manager keeps for a running session.
pub(crate) struct SessionTask {
    pub handle: SessionHandle,
    pub inputs: mpsc::UnboundedSender<SessionInput>,
    pub cancel: CancellationToken,
}

/// Start a session task.
pub(crate) fn spawn(
    params: SessionParams,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
) -> SessionTask {
    let (negotiator, handle) = Negotiator::new(params);
    let (inputs, inputs_rx) = mpsc::unbounded_channel();
    let cancel = negotiator.cancel.clone();
    let span = tracing::info_span!("session", id = %handle.id, room = %handle.room_id);
    tokio::spawn(negotiator.run(inputs_rx, engine_events).instrument(span));

    SessionTask {
        handle,
        inputs,
        cancel,
    }
}

/// Why the session loop stopped.
enum Stop {
    Cancelled,
    Negotiation(EngineError),
    MediaAcquisition(EngineError),
    /// The engine reported a terminal connection state.
    Ended,
}

type Step = Result<(), Stop>;

/// Race an engine call against teardown.
async fn guarded<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, EngineError>>,
) -> Result<Result<T, EngineError>, Stop> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Stop::Cancelled),
        result = call => Ok(result),
    }
}

pub(crate) struct Negotiator {
    session: PeerSession,
    engine: Box<dyn MediaEngine>,
    transport: Arc<dyn SignalingTransport>,
    cancel: CancellationToken,
    snapshot: watch::Sender<SessionSnapshot>,
    events: mpsc::UnboundedSender<SessionEvent>,
    reports: mpsc::UnboundedSender<StateReport>,
    polite_tie_break: bool,
}

impl Negotiator {
    pub(crate) fn new(params: SessionParams) -> (Self, SessionHandle) {
        let id = SessionId::generate();
        let session = PeerSession {
            id,
            room_id: params.room_id,
            local_user: params.local_user,
            remote_user: params.remote_user,
            state: SessionState::Idle,
            local_description: None,
            remote_description: None,
            candidates: CandidateQueue::new(),
            local_media: params.local_media,
            audio_enabled: true,
            video_enabled: true,
            remote_media: None,
            negotiation: params.offer.as_ref().map(|offer| offer.negotiation),
            pending_offer: params.offer,
            created_at: id.created_at().unwrap_or_else(Utc::now),
        };
        let (snapshot, snapshot_rx) = watch::channel(session.snapshot());
        let (events, events_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            id: session.id,
            room_id: session.room_id.clone(),
            snapshot: snapshot_rx,
            events: Arc::new(Mutex::new(Some(SessionEvents { rx: events_rx }))),
        };
        let negotiator = Self {
            session,
            engine: params.engine,
            transport: params.transport,
            cancel: CancellationToken::new(),
            snapshot,
            events,
            reports: params.reports,
            polite_tie_break: params.polite_tie_break,
        };
        (negotiator, handle)
    }

    pub(crate) async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let cancel = self.cancel.clone();
        tracing::info!(remote = ?self.session.remote_user, "Session started");

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Stop::Cancelled),
                input = inputs.recv() => match input {
                    Some(input) => self.on_input(input).await,
                    None => Err(Stop::Cancelled),
                },
                Some(event) = engine_events.recv() => self.on_engine_event(event).await,
            };
            if let Err(stop) = step {
                self.stop(stop);
                break;
            }
        }

        // No further dispatch once the loop is done.
        inputs.close();
        self.teardown().await;
    }

    async fn on_input(&mut self, input: SessionInput) -> Step {
        match input {
            SessionInput::Initiate => self.initiate().await,
            SessionInput::Accept(constraints) => self.accept(constraints).await,
            SessionInput::SetTrackEnabled { kind, enabled } => {
                self.set_track_enabled(kind, enabled).await
            }
            SessionInput::Signal(message) => match message.kind {
                SignalKind::Offer => self.on_offer(message).await,
                SignalKind::Answer => self.on_answer(message).await,
                SignalKind::Candidate => self.on_candidate(message).await,
            },
        }
    }

    async fn initiate(&mut self) -> Step {
        if self.session.state != SessionState::Idle {
            tracing::warn!(state = %self.session.state, "Ignoring initiate outside idle");
            return Ok(());
        }

        let offer = guarded(&self.cancel, self.engine.create_offer())
            .await?
            .map_err(Stop::Negotiation)?;
        guarded(&self.cancel, self.engine.set_local_description(offer.clone()))
            .await?
            .map_err(Stop::Negotiation)?;

        let negotiation = NegotiationId::generate();
        self.session.negotiation = Some(negotiation);
        self.session.local_description = Some(offer.clone());
        self.transition(SessionState::NegotiatingOffer);

        let receiver = Recipient::from(self.session.remote_user.clone());
        let payload = DescriptionPayload {
            description: offer,
            negotiation,
        };
        self.send(SignalKind::Offer, receiver, &payload).await;
        Ok(())
    }

    async fn on_offer(&mut self, message: SignalMessage) -> Step {
        let crossed = self.session.state == SessionState::NegotiatingOffer
            && self.session.remote_description.is_none()
            && self.session.remote_user.as_ref() == Some(&message.sender);
        if crossed {
            return self.on_crossed_offer(message).await;
        }
        if self.session.state != SessionState::Idle || self.session.pending_offer.is_some() {
            self.anomaly(ProtocolAnomaly::DuplicateOffer {
                sender: message.sender,
            });
            return Ok(());
        }
        let payload = match message.description() {
            Ok(payload) => payload,
            Err(anomaly) => {
                self.anomaly(anomaly);
                return Ok(());
            }
        };

        if self.session.remote_user.is_none() {
            self.session.remote_user = Some(message.sender);
        }
        self.session.negotiation = Some(payload.negotiation);
        self.session.pending_offer = Some(payload);
        self.publish_snapshot();
        tracing::info!(remote = ?self.session.remote_user, "Incoming offer stored");
        Ok(())
    }

    /// Both sides offered to each other. The lower identity withdraws its
    /// offer and answers; the higher one keeps waiting for that answer.
    async fn on_crossed_offer(&mut self, message: SignalMessage) -> Step {
        if !self.polite_tie_break || self.session.local_user > message.sender {
            self.anomaly(ProtocolAnomaly::GlareLost {
                sender: message.sender,
            });
            return Ok(());
        }
        let payload = match message.description() {
            Ok(payload) => payload,
            Err(anomaly) => {
                self.anomaly(anomaly);
                return Ok(());
            }
        };

        guarded(&self.cancel, self.engine.rollback_local_description())
            .await?
            .map_err(Stop::Negotiation)?;
        tracing::info!(remote = %message.sender, "Offers crossed, withdrawing ours");
        self.session.local_description = None;
        self.session.negotiation = Some(payload.negotiation);
        self.session.pending_offer = Some(payload);

        // Media is already held, so the constraints are not used.
        self.accept(MediaConstraints::default()).await
    }

    async fn accept(&mut self, constraints: MediaConstraints) -> Step {
        let Some(offer) = self.session.pending_offer.take() else {
            tracing::warn!(state = %self.session.state, "No incoming offer to answer");
            return Ok(());
        };

        if self.session.local_media.is_none() {
            let media = guarded(&self.cancel, self.engine.acquire_local_media(&constraints))
                .await?
                .map_err(Stop::MediaAcquisition)?;
            self.session.local_media = Some(media);
        }

        self.transition(SessionState::NegotiatingAnswer);
        guarded(
            &self.cancel,
            self.engine.set_remote_description(offer.description.clone()),
        )
        .await?
        .map_err(Stop::Negotiation)?;
        self.session.remote_description = Some(offer.description);
        self.drain_candidates().await;

        let answer = guarded(&self.cancel, self.engine.create_answer())
            .await?
            .map_err(Stop::Negotiation)?;
        guarded(&self.cancel, self.engine.set_local_description(answer.clone()))
            .await?
            .map_err(Stop::Negotiation)?;
        self.session.local_description = Some(answer.clone());
        self.publish_snapshot();

        let receiver = Recipient::from(self.session.remote_user.clone());
        let payload = DescriptionPayload {
            description: answer,
            negotiation: offer.negotiation,
        };
        self.send(SignalKind::Answer, receiver, &payload).await;
        Ok(())
    }

    async fn set_track_enabled(&mut self, kind: MediaKind, enabled: bool) -> Step {
        let Some(media) = self.session.local_media.as_ref() else {
            tracing::warn!(%kind, "No local media to toggle");
            return Ok(());
        };
        let result = guarded(
            &self.cancel,
            self.engine.set_track_enabled(media, kind, enabled),
        )
        .await?;
        if let Err(e) = result {
            tracing::warn!(error = %e, %kind, "Could not toggle local track");
            return Ok(());
        }

        match kind {
            MediaKind::Audio => self.session.audio_enabled = enabled,
            MediaKind::Video => self.session.video_enabled = enabled,
        }
        self.publish_snapshot();
        tracing::info!(%kind, enabled, "Local track toggled");
        Ok(())
    }

    async fn on_answer(&mut self, message: SignalMessage) -> Step {
        if self.session.state != SessionState::NegotiatingOffer
            || self.session.remote_description.is_some()
        {
            self.anomaly(ProtocolAnomaly::UnexpectedSignal {
                kind: message.kind,
                sender: message.sender,
                state: self.session.state,
            });
            return Ok(());
        }
        let payload = match message.description() {
            Ok(payload) => payload,
            Err(anomaly) => {
                self.anomaly(anomaly);
                return Ok(());
            }
        };
        if self.session.negotiation != Some(payload.negotiation) {
            self.anomaly(ProtocolAnomaly::StaleAnswer {
                sender: message.sender,
            });
            return Ok(());
        }

        guarded(
            &self.cancel,
            self.engine.set_remote_description(payload.description.clone()),
        )
        .await?
        .map_err(Stop::Negotiation)?;
        self.session.remote_description = Some(payload.description);
        if self.session.remote_user.is_none() {
            self.session.remote_user = Some(message.sender);
        }
        self.drain_candidates().await;
        self.publish_snapshot();

        tracing::info!(remote = ?self.session.remote_user, "Answer applied, waiting for connectivity");
        Ok(())
    }

    async fn on_candidate(&mut self, message: SignalMessage) -> Step {
        let payload = match message.candidate() {
            Ok(payload) => payload,
            Err(anomaly) => {
                self.anomaly(anomaly);
                return Ok(());
            }
        };
        let stale = match (payload.negotiation, self.session.negotiation) {
            (Some(theirs), Some(ours)) => theirs != ours,
            _ => false,
        };
        if stale {
            self.anomaly(ProtocolAnomaly::StaleCandidate {
                sender: message.sender,
            });
            return Ok(());
        }

        match self.session.candidates.enqueue(payload.candidate) {
            Admission::Queued => {
                tracing::debug!(
                    pending = self.session.candidates.len(),
                    "Candidate queued until remote description"
                );
                self.publish_snapshot();
            }
            Admission::PassThrough(candidate) => {
                if let Err(e) = guarded(&self.cancel, self.engine.add_candidate(candidate)).await? {
                    tracing::warn!(error = %e, "Ignoring candidate that failed to apply");
                }
            }
        }
        Ok(())
    }

    async fn drain_candidates(&mut self) {
        let engine = self.engine.as_ref();
        let cancel = &self.cancel;
        let applied = self
            .session
            .candidates
            .drain_into(move |candidate| async move {
                if cancel.is_cancelled() {
                    return Err(EngineError::Closed);
                }
                engine.add_candidate(candidate).await
            })
            .await;
        if applied > 0 {
            tracing::debug!(applied, "Applied queued candidates");
        }
    }

    async fn on_engine_event(&mut self, event: EngineEvent) -> Step {
        match event {
            // Only reached between inputs, so a candidate always trails the
            // description that produced it on the wire.
            EngineEvent::CandidateDiscovered(candidate) => {
                let receiver = Recipient::from(self.session.remote_user.clone());
                let payload = CandidatePayload {
                    candidate,
                    negotiation: self.session.negotiation,
                };
                self.send(SignalKind::Candidate, receiver, &payload).await;
                Ok(())
            }
            EngineEvent::RemoteMedia(source) => {
                tracing::info!(source = %source.id, "Remote media available");
                self.session.remote_media = Some(source.clone());
                self.publish_snapshot();
                let _ = self.events.send(SessionEvent::RemoteMedia(source));
                Ok(())
            }
            EngineEvent::ConnectionStateChanged(state) => match state {
                ConnectionState::Connected => {
                    self.transition(SessionState::Connected);
                    Ok(())
                }
                ConnectionState::Disconnected | ConnectionState::Closed => {
                    tracing::warn!(engine_state = %state, "Connection lost");
                    self.transition(SessionState::Disconnected);
                    Err(Stop::Ended)
                }
                ConnectionState::Failed => {
                    tracing::warn!("Connection failed");
                    self.transition(SessionState::Failed);
                    Err(Stop::Ended)
                }
                ConnectionState::New | ConnectionState::Connecting => {
                    tracing::debug!(engine_state = %state, "Connection progressing");
                    Ok(())
                }
            },
        }
    }

    fn stop(&mut self, stop: Stop) {
        match stop {
            Stop::Cancelled => tracing::debug!("Teardown requested"),
            Stop::Ended => {}
            Stop::Negotiation(e) => {
                tracing::error!(error = %CallError::Negotiation(e), "Negotiation failed");
                self.transition(SessionState::Failed);
            }
            Stop::MediaAcquisition(e) => {
                tracing::error!(error = %CallError::MediaAcquisition(e), "Could not answer call");
                self.transition(SessionState::Failed);
            }
        }
    }

    /// Release everything the session owns. Safe to call more than once.
    pub(crate) async fn teardown(&mut self) {
        if self.session.state == SessionState::Closed {
            return;
        }
        if let Some(media) = self.session.local_media.take() {
            self.engine.release_local_media(media);
        }
        self.engine.close().await;
        self.session.candidates.clear();
        self.session.pending_offer = None;
        self.transition(SessionState::Closed);
        tracing::info!("Session closed");
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.session.state;
        if from == to || from == SessionState::Closed {
            return;
        }
        self.session.state = to;
        tracing::info!(%from, %to, "Session state changed");

        self.publish_snapshot();
        let _ = self.events.send(SessionEvent::StateChanged { from, to });
        let _ = self.reports.send(StateReport {
            session: self.session.id,
            state: to,
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.session.snapshot());
    }

    fn anomaly(&self, anomaly: ProtocolAnomaly) {
        tracing::warn!(%anomaly, state = %self.session.state, "Dropping signal");
    }

    async fn send(&self, kind: SignalKind, receiver: Recipient, payload: &impl Serialize) {
        let message =
            match SignalMessage::new(kind, self.session.local_user.clone(), receiver, payload) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %CallError::Encode(e), %kind, "Could not build signal");
                    return;
                }
            };
        let receiver = message.receiver.clone();
        match self.transport.publish(&self.session.room_id, message).await {
            Ok(()) => tracing::debug!(%kind, %receiver, "Signal sent"),
            Err(e) => {
                tracing::error!(error = %CallError::Transport(e), %kind, "Could not send signal")
            }
        }
    }
}
