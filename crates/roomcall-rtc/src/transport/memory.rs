//! In-process signaling hub.
//!
//! One [`MemoryHub`] stands in for the room broadcast service; each
//! participant gets its own [`MemoryTransport`] from [`MemoryHub::connect`].
//! Messages are encoded to JSON on publish and decoded per delivery, so the
//! wire shape is exercised exactly as a networked transport would.

use super::{SignalingTransport, TransportError};
use crate::signal::SignalMessage;
use async_trait::async_trait;
use roomcall_common::{RoomId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

struct Subscriber {
    user: UserId,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    /// Active subscriptions (room → subscribers)
    rooms: Arc<RwLock<HashMap<RoomId, Vec<Subscriber>>>>,
    /// Deliver messages back to their publisher too.
    self_delivery: bool,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loop messages back to the publisher, like a misconfigured broadcast channel.
    pub fn with_self_delivery(mut self) -> Self {
        self.self_delivery = true;
        self
    }

    pub fn connect(&self, user: impl Into<UserId>) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            user: user.into(),
        }
    }

    pub async fn subscriber_count(&self, room: &RoomId) -> usize {
        self.rooms.read().await.get(room).map_or(0, Vec::len)
    }
}

/// One participant's connection to a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    user: UserId,
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn subscribe(
        &self,
        room: &RoomId,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.hub.rooms.write().await;
        let subscribers = rooms.entry(room.clone()).or_default();
        subscribers.retain(|s| s.user != self.user);
        subscribers.push(Subscriber {
            user: self.user.clone(),
            tx,
        });

        tracing::debug!(room = %room, user = %self.user, "Subscribed to room");
        Ok(rx)
    }

    async fn publish(&self, room: &RoomId, message: SignalMessage) -> Result<(), TransportError> {
        let wire = message.to_json()?;
        let mut rooms = self.hub.rooms.write().await;
        let subscribers = rooms
            .get_mut(room)
            .filter(|subs| subs.iter().any(|s| s.user == self.user))
            .ok_or_else(|| TransportError::NotSubscribed(room.clone()))?;

        let delivered = SignalMessage::from_json(&wire)?;
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if subscriber.user == self.user && !self.hub.self_delivery {
                continue;
            }
            let _ = subscriber.tx.send(delivered.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, room: &RoomId) -> Result<(), TransportError> {
        let mut rooms = self.hub.rooms.write().await;
        if let Some(subscribers) = rooms.get_mut(room) {
            subscribers.retain(|s| s.user != self.user);
            if subscribers.is_empty() {
                rooms.remove(room);
            }
        }

        tracing::debug!(room = %room, user = %self.user, "Unsubscribed from room");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Recipient, SignalKind};
    use serde_json::json;

    fn message(sender: &str) -> SignalMessage {
        SignalMessage {
            kind: SignalKind::Candidate,
            sender: UserId::from(sender),
            receiver: Recipient::All,
            payload: json!({ "candidate": "candidate:1 1 udp 1 192.0.2.1 9 typ host" }),
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_publisher() {
        let hub = MemoryHub::new();
        let room = RoomId::from("ABCDEF");
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");
        let mut alice_rx = alice.subscribe(&room).await.unwrap();
        let mut bob_rx = bob.subscribe(&room).await.unwrap();

        alice.publish(&room, message("alice")).await.unwrap();

        assert_eq!(bob_rx.recv().await.unwrap().sender, UserId::from("alice"));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_self_delivery_loops_back() {
        let hub = MemoryHub::new().with_self_delivery();
        let room = RoomId::from("ABCDEF");
        let alice = hub.connect("alice");
        let mut rx = alice.subscribe(&room).await.unwrap();

        alice.publish(&room, message("alice")).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_publish_requires_subscription() {
        let hub = MemoryHub::new();
        let room = RoomId::from("ABCDEF");
        let err = hub.connect("alice").publish(&room, message("alice")).await;
        assert!(matches!(err, Err(TransportError::NotSubscribed(_))));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_room_when_empty() {
        let hub = MemoryHub::new();
        let room = RoomId::from("ABCDEF");
        let alice = hub.connect("alice");
        let _rx = alice.subscribe(&room).await.unwrap();
        assert_eq!(hub.subscriber_count(&room).await, 1);

        alice.unsubscribe(&room).await.unwrap();
        assert_eq!(hub.subscriber_count(&room).await, 0);
    }
}
