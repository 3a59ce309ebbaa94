//! Session lifecycle manager.
//!
//! Owns the registry of peer sessions, keyed by room and remote identity, and
//! the per-room router tasks. A session started before its remote is known
//! (a wildcard call) is registered under `(room, None)` and rebound to the
//! answering identity when the first answer arrives.

use crate::error::{CallError, CallResult};
use crate::media::{MediaConstraints, MediaEngineFactory, MediaKind};
use crate::router::SignalRouter;
use crate::session::{
    self, SessionHandle, SessionInput, SessionParams, SessionState, SessionTask, StateReport,
};
use crate::signal::{DescriptionPayload, Recipient};
use crate::transport::SignalingTransport;
use futures_util::Stream;
use roomcall_common::config::AppConfig;
use roomcall_common::{RoomId, SessionId, UserId};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    room: RoomId,
    /// `None` while a wildcard call waits for its first answer.
    remote: Option<UserId>,
}

enum Slot {
    /// Reserved while local media is being acquired. Holds the attempt number,
    /// so a start only completes into the reservation it made.
    Starting(u64),
    Active(SessionTask),
}

/// Outcome of checking an inbound offer against a pending local call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Glare {
    /// No pending local call in the room.
    None,
    /// We are the polite side: the pending call was ended, or abandoned if
    /// it was still acquiring media.
    Yielded,
    /// Our pending call wins; the inbound offer must be dropped.
    Held,
}

pub(crate) struct ManagerInner {
    local: UserId,
    transport: Arc<dyn SignalingTransport>,
    engines: Arc<dyn MediaEngineFactory>,
    config: AppConfig,
    sessions: RwLock<HashMap<SessionKey, Slot>>,
    /// Router task per joined room.
    rooms: RwLock<HashMap<RoomId, JoinHandle<()>>>,
    reports: mpsc::UnboundedSender<StateReport>,
    incoming: mpsc::UnboundedSender<SessionHandle>,
    attempts: AtomicU64,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for router in self.rooms.get_mut().values() {
            router.abort();
        }
        for slot in self.sessions.get_mut().values() {
            if let Slot::Active(task) = slot {
                task.cancel.cancel();
            }
        }
    }
}

/// Handles of sessions created by inbound offers.
pub struct IncomingCalls {
    rx: mpsc::UnboundedReceiver<SessionHandle>,
}

impl Stream for IncomingCalls {
    type Item = SessionHandle;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Entry point for the UI layer. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<ManagerInner>,
}

impl CallManager {
    /// Create a manager for `local`. Must be called inside a Tokio runtime.
    pub fn new(
        local: impl Into<UserId>,
        transport: Arc<dyn SignalingTransport>,
        engines: Arc<dyn MediaEngineFactory>,
        config: AppConfig,
    ) -> (Self, IncomingCalls) {
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let (incoming, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            local: local.into(),
            transport,
            engines,
            config,
            sessions: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            reports,
            incoming,
            attempts: AtomicU64::new(0),
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), reports_rx));

        let manager = Self { inner };
        (manager, IncomingCalls { rx: incoming_rx })
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn local_user(&self) -> &UserId {
        &self.inner.local
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Subscribe to a room and start routing its signals. Idempotent.
    pub async fn join_room(&self, room: &RoomId) -> CallResult<()> {
        // Fast path: already joined
        if self.inner.rooms.read().await.contains_key(room) {
            return Ok(());
        }

        let mut rooms = self.inner.rooms.write().await;
        if rooms.contains_key(room) {
            return Ok(());
        }

        let rx = self.inner.transport.subscribe(room).await?;
        let router = self.router(room);
        let span = tracing::info_span!("router", room = %room, local = %self.inner.local);
        rooms.insert(room.clone(), tokio::spawn(router.run(rx).instrument(span)));

        tracing::info!(room = %room, user = %self.inner.local, "Joined room");
        Ok(())
    }

    /// End every session in the room, stop its router and unsubscribe.
    ///
    /// A call still acquiring media loses its reservation and fails with
    /// [`CallError::Abandoned`].
    pub async fn leave_room(&self, room: &RoomId) -> CallResult<()> {
        let ended = {
            let mut sessions = self.inner.sessions.write().await;
            let keys: Vec<SessionKey> = sessions
                .keys()
                .filter(|key| &key.room == room)
                .cloned()
                .collect();
            let mut ended = 0;
            for key in keys {
                if let Some(Slot::Active(task)) = sessions.remove(&key) {
                    task.cancel.cancel();
                    ended += 1;
                }
            }
            ended
        };

        let router = self.inner.rooms.write().await.remove(room);
        if let Some(router) = router {
            router.abort();
            self.inner.transport.unsubscribe(room).await?;
            tracing::info!(room = %room, sessions = ended, "Left room");
        }
        Ok(())
    }

    /// Call whoever answers first in `room`, with the configured media.
    pub async fn start_call(&self, room: &RoomId) -> CallResult<SessionHandle> {
        let constraints = MediaConstraints::from(&self.inner.config.media);
        self.start_call_with(room, None, constraints).await
    }

    /// Call a known identity in `room`.
    pub async fn call_user(&self, room: &RoomId, remote: UserId) -> CallResult<SessionHandle> {
        let constraints = MediaConstraints::from(&self.inner.config.media);
        self.start_call_with(room, Some(remote), constraints).await
    }

    /// Start an outbound call.
    ///
    /// On [`CallError::MediaAcquisition`] nothing is left registered, so the
    /// caller can retry with narrower constraints such as
    /// [`MediaConstraints::audio_only`]. If the reservation is taken away while
    /// media is being acquired, the media is released and the call fails with
    /// [`CallError::Abandoned`].
    pub async fn start_call_with(
        &self,
        room: &RoomId,
        remote: Option<UserId>,
        constraints: MediaConstraints,
    ) -> CallResult<SessionHandle> {
        self.join_room(room).await?;

        let key = SessionKey {
            room: room.clone(),
            remote: remote.clone(),
        };
        let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.inner.sessions.write().await;
            if sessions.contains_key(&key) {
                return Err(CallError::SessionAlreadyActive {
                    room: room.clone(),
                    remote: Recipient::from(remote).to_string(),
                });
            }
            sessions.insert(key.clone(), Slot::Starting(attempt));
        }

        let (engine, engine_events) = self.inner.engines.create(&self.inner.config.ice.servers);
        let media = match engine.acquire_local_media(&constraints).await {
            Ok(media) => media,
            Err(e) => {
                self.release_reservation(&key, attempt).await;
                engine.close().await;
                tracing::error!(room = %room, error = %e, "Could not acquire local media");
                return Err(CallError::MediaAcquisition(e));
            }
        };

        let mut sessions = self.inner.sessions.write().await;
        if !matches!(sessions.get(&key), Some(Slot::Starting(a)) if *a == attempt) {
            drop(sessions);
            engine.release_local_media(media);
            engine.close().await;
            tracing::info!(room = %room, "Call abandoned while acquiring media");
            return Err(CallError::Abandoned(room.clone()));
        }

        let task = session::spawn(
            SessionParams {
                room_id: room.clone(),
                local_user: self.inner.local.clone(),
                remote_user: remote,
                engine,
                local_media: Some(media),
                offer: None,
                transport: self.inner.transport.clone(),
                reports: self.inner.reports.clone(),
                polite_tie_break: self.inner.config.call.polite_tie_break,
            },
            engine_events,
        );
        let handle = task.handle.clone();
        let _ = task.inputs.send(SessionInput::Initiate);
        sessions.insert(key, Slot::Active(task));
        drop(sessions);

        tracing::info!(
            session = %handle.id(),
            room = %room,
            audio = constraints.audio,
            video = constraints.video,
            "Outgoing call started"
        );
        Ok(handle)
    }

    /// Answer an inbound session that is still waiting (`auto_answer = false`).
    pub async fn answer_incoming(&self, handle: &SessionHandle) -> CallResult<()> {
        let Some((_, inputs)) = self.find(handle.id()).await else {
            return Err(CallError::UnknownSession(handle.id()));
        };
        let snapshot = handle.snapshot();
        if snapshot.state != SessionState::Idle || !snapshot.incoming_offer {
            return Err(CallError::NotAwaitingAnswer(handle.id()));
        }

        let constraints = MediaConstraints::from(&self.inner.config.media);
        inputs
            .send(SessionInput::Accept(constraints))
            .map_err(|_| CallError::UnknownSession(handle.id()))?;
        tracing::info!(session = %handle.id(), "Answering incoming call");
        Ok(())
    }

    /// Start or stop sending local audio or video without renegotiating.
    ///
    /// The session reports the result in its snapshot; toggling a kind that
    /// was never captured leaves the snapshot unchanged.
    pub async fn set_track_enabled(
        &self,
        handle: &SessionHandle,
        kind: MediaKind,
        enabled: bool,
    ) -> CallResult<()> {
        let Some((_, inputs)) = self.find(handle.id()).await else {
            return Err(CallError::UnknownSession(handle.id()));
        };
        inputs
            .send(SessionInput::SetTrackEnabled { kind, enabled })
            .map_err(|_| CallError::UnknownSession(handle.id()))?;
        tracing::debug!(session = %handle.id(), %kind, enabled, "Track toggle requested");
        Ok(())
    }

    /// Mute or unmute the microphone of a call.
    pub async fn set_muted(&self, handle: &SessionHandle, muted: bool) -> CallResult<()> {
        self.set_track_enabled(handle, MediaKind::Audio, !muted).await
    }

    /// Tear a session down. Always succeeds, also for sessions already closed.
    pub async fn end_call(&self, handle: &SessionHandle) {
        match self.remove(handle.id()).await {
            Some(task) => {
                task.cancel.cancel();
                tracing::info!(session = %handle.id(), room = %handle.room_id(), "Call ended");
            }
            None => tracing::debug!(session = %handle.id(), "Call already ended"),
        }
    }

    /// React to a session's state change. Ended sessions leave the registry.
    pub async fn on_connection_state_change(&self, handle: &SessionHandle, state: SessionState) {
        tracing::info!(
            session = %handle.id(),
            room = %handle.room_id(),
            state = %state,
            "Call state changed"
        );
        if state.is_ended() {
            if let Some(task) = self.remove(handle.id()).await {
                task.cancel.cancel();
            }
        }
    }

    /// Handles of every registered session.
    pub async fn sessions(&self) -> Vec<SessionHandle> {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .filter_map(|slot| match slot {
                Slot::Active(task) => Some(task.handle.clone()),
                Slot::Starting(_) => None,
            })
            .collect()
    }

    pub(crate) fn router(&self, room: &RoomId) -> SignalRouter {
        SignalRouter::new(
            self.inner.local.clone(),
            room.clone(),
            Arc::downgrade(&self.inner),
        )
    }

    /// Session bound to `sender` in `room`.
    pub(crate) async fn lookup(
        &self,
        room: &RoomId,
        sender: &UserId,
    ) -> Option<(SessionId, mpsc::UnboundedSender<SessionInput>)> {
        let key = SessionKey {
            room: room.clone(),
            remote: Some(sender.clone()),
        };
        match self.inner.sessions.read().await.get(&key) {
            Some(Slot::Active(task)) => Some((task.handle.id(), task.inputs.clone())),
            _ => None,
        }
    }

    /// Register a session for an inbound offer and announce it.
    pub(crate) async fn open_inbound(
        &self,
        room: &RoomId,
        sender: UserId,
        offer: DescriptionPayload,
    ) -> CallResult<SessionHandle> {
        let key = SessionKey {
            room: room.clone(),
            remote: Some(sender.clone()),
        };
        let mut sessions = self.inner.sessions.write().await;
        if sessions.contains_key(&key) {
            return Err(CallError::SessionAlreadyActive {
                room: room.clone(),
                remote: sender.to_string(),
            });
        }

        let (engine, engine_events) = self.inner.engines.create(&self.inner.config.ice.servers);
        let task = session::spawn(
            SessionParams {
                room_id: room.clone(),
                local_user: self.inner.local.clone(),
                remote_user: Some(sender.clone()),
                engine,
                local_media: None,
                offer: Some(offer),
                transport: self.inner.transport.clone(),
                reports: self.inner.reports.clone(),
                polite_tie_break: self.inner.config.call.polite_tie_break,
            },
            engine_events,
        );
        let handle = task.handle.clone();
        if self.inner.config.call.auto_answer {
            let constraints = MediaConstraints::from(&self.inner.config.media);
            let _ = task.inputs.send(SessionInput::Accept(constraints));
        }
        sessions.insert(key, Slot::Active(task));
        drop(sessions);

        tracing::info!(
            session = %handle.id(),
            room = %room,
            remote = %sender,
            auto_answer = self.inner.config.call.auto_answer,
            "Incoming call"
        );
        let _ = self.inner.incoming.send(handle.clone());
        Ok(handle)
    }

    /// Rebind the room's pending wildcard call to the identity that answered it.
    pub(crate) async fn bind_pending(
        &self,
        room: &RoomId,
        sender: &UserId,
    ) -> Option<(SessionId, mpsc::UnboundedSender<SessionInput>)> {
        let pending = SessionKey {
            room: room.clone(),
            remote: None,
        };
        let mut sessions = self.inner.sessions.write().await;
        let task = match sessions.remove(&pending)? {
            Slot::Active(task) => task,
            starting @ Slot::Starting(_) => {
                sessions.insert(pending, starting);
                return None;
            }
        };

        let found = (task.handle.id(), task.inputs.clone());
        tracing::info!(session = %found.0, room = %room, remote = %sender, "Wildcard call bound");
        let bound = SessionKey {
            room: room.clone(),
            remote: Some(sender.clone()),
        };
        sessions.insert(bound, Slot::Active(task));
        Some(found)
    }

    /// Polite-peer tie-break between an inbound offer and a pending local call.
    ///
    /// The lower identity is polite: it ends its own call and answers. A call
    /// still acquiring media counts as pending; yielding takes its reservation
    /// away so the start fails with [`CallError::Abandoned`].
    pub(crate) async fn resolve_glare(&self, room: &RoomId, sender: &UserId) -> Glare {
        let pending = SessionKey {
            room: room.clone(),
            remote: None,
        };
        let mut sessions = self.inner.sessions.write().await;
        if !sessions.contains_key(&pending) {
            return Glare::None;
        }
        if !self.inner.config.call.polite_tie_break || self.inner.local > *sender {
            return Glare::Held;
        }

        match sessions.remove(&pending) {
            Some(Slot::Active(task)) => {
                task.cancel.cancel();
                tracing::info!(
                    session = %task.handle.id(),
                    room = %room,
                    remote = %sender,
                    "Yielding pending call to inbound offer"
                );
            }
            Some(Slot::Starting(_)) => {
                tracing::info!(
                    room = %room,
                    remote = %sender,
                    "Abandoning starting call for inbound offer"
                );
            }
            None => {}
        }
        Glare::Yielded
    }

    /// Drop a `Starting` reservation, unless another attempt has replaced it.
    async fn release_reservation(&self, key: &SessionKey, attempt: u64) {
        let mut sessions = self.inner.sessions.write().await;
        if matches!(sessions.get(key), Some(Slot::Starting(a)) if *a == attempt) {
            sessions.remove(key);
        }
    }

    async fn find(
        &self,
        id: SessionId,
    ) -> Option<(SessionHandle, mpsc::UnboundedSender<SessionInput>)> {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .find_map(|slot| match slot {
                Slot::Active(task) if task.handle.id() == id => {
                    Some((task.handle.clone(), task.inputs.clone()))
                }
                _ => None,
            })
    }

    async fn remove(&self, id: SessionId) -> Option<SessionTask> {
        let mut sessions = self.inner.sessions.write().await;
        let key = sessions.iter().find_map(|(key, slot)| match slot {
            Slot::Active(task) if task.handle.id() == id => Some(key.clone()),
            _ => None,
        })?;
        match sessions.remove(&key) {
            Some(Slot::Active(task)) => Some(task),
            _ => None,
        }
    }
}

/// Feed session state reports back into the manager until it is dropped.
async fn supervise(inner: Weak<ManagerInner>, mut reports: mpsc::UnboundedReceiver<StateReport>) {
    while let Some(report) = reports.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = CallManager::from_inner(inner);
        if let Some((handle, _)) = manager.find(report.session).await {
            manager
                .on_connection_state_change(&handle, report.state)
                .await;
        }
    }
}
