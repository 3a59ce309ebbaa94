//! Per-room signal router.
//!
//! Filters the room's inbound messages down to those meant for the local
//! user and hands each one to the session bound to its sender, creating a
//! session for a fresh offer. Messages are processed one at a time, so
//! per-sender order on the transport is the order sessions see.

use crate::error::ProtocolAnomaly;
use crate::manager::{CallManager, Glare, ManagerInner};
use crate::session::SessionInput;
use crate::signal::{SignalKind, SignalMessage};
use roomcall_common::{RoomId, SessionId, UserId};
use std::sync::Weak;
use tokio::sync::mpsc;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Dispatched(SessionId),
    /// An offer opened a new session.
    Created(SessionId),
    Ignored(Ignored),
    Anomaly(ProtocolAnomaly),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    /// Our own message looped back by the transport.
    SelfEcho,
    /// Addressed to someone else.
    NotAddressed,
    /// The manager is gone.
    Shutdown,
}

pub struct SignalRouter {
    local: UserId,
    room: RoomId,
    manager: Weak<ManagerInner>,
}

impl SignalRouter {
    pub(crate) fn new(local: UserId, room: RoomId, manager: Weak<ManagerInner>) -> Self {
        Self {
            local,
            room,
            manager,
        }
    }

    /// Route until the subscription closes or the manager is dropped.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<SignalMessage>) {
        while let Some(message) = rx.recv().await {
            if self.route(message).await == Route::Ignored(Ignored::Shutdown) {
                break;
            }
        }
        tracing::debug!(room = %self.room, "Router stopped");
    }

    pub async fn route(&self, message: SignalMessage) -> Route {
        if message.sender == self.local {
            tracing::debug!(kind = %message.kind, "Dropping self-echo");
            return Route::Ignored(Ignored::SelfEcho);
        }
        if !message.receiver.includes(&self.local) {
            tracing::debug!(
                kind = %message.kind,
                sender = %message.sender,
                receiver = %message.receiver,
                "Not addressed to us"
            );
            return Route::Ignored(Ignored::NotAddressed);
        }
        let Some(inner) = self.manager.upgrade() else {
            return Route::Ignored(Ignored::Shutdown);
        };
        let manager = CallManager::from_inner(inner);

        if let Some((session, inputs)) = manager.lookup(&self.room, &message.sender).await {
            return self.dispatch(session, &inputs, message);
        }

        match message.kind {
            SignalKind::Offer => {
                let offer = match message.description() {
                    Ok(offer) => offer,
                    Err(anomaly) => return self.anomaly(anomaly),
                };
                if manager.resolve_glare(&self.room, &message.sender).await == Glare::Held {
                    return self.anomaly(ProtocolAnomaly::GlareLost {
                        sender: message.sender,
                    });
                }
                match manager
                    .open_inbound(&self.room, message.sender.clone(), offer)
                    .await
                {
                    Ok(handle) => Route::Created(handle.id()),
                    Err(e) => {
                        tracing::warn!(error = %e, sender = %message.sender, "Could not open session");
                        self.anomaly(ProtocolAnomaly::DuplicateOffer {
                            sender: message.sender,
                        })
                    }
                }
            }
            SignalKind::Answer => match manager.bind_pending(&self.room, &message.sender).await {
                Some((session, inputs)) => self.dispatch(session, &inputs, message),
                None => self.anomaly(ProtocolAnomaly::NoSession {
                    kind: message.kind,
                    sender: message.sender,
                }),
            },
            SignalKind::Candidate => self.anomaly(ProtocolAnomaly::NoSession {
                kind: message.kind,
                sender: message.sender,
            }),
        }
    }

    fn dispatch(
        &self,
        session: SessionId,
        inputs: &mpsc::UnboundedSender<SessionInput>,
        message: SignalMessage,
    ) -> Route {
        let kind = message.kind;
        let sender = message.sender.clone();
        match inputs.send(SessionInput::Signal(message)) {
            Ok(()) => {
                tracing::debug!(session = %session, kind = %kind, sender = %sender, "Dispatched");
                Route::Dispatched(session)
            }
            // The session finished between lookup and send.
            Err(_) => self.anomaly(ProtocolAnomaly::NoSession { kind, sender }),
        }
    }

    fn anomaly(&self, anomaly: ProtocolAnomaly) -> Route {
        tracing::warn!(room = %self.room, %anomaly, "Dropping signal");
        Route::Anomaly(anomaly)
    }
}
