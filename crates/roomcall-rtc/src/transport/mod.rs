//! Signaling transport contract.
//!
//! A per-room broadcast channel: messages reach every current subscriber
//! except the publisher, in order per sender. Delivery is at-least-once and
//! nothing is promised across senders. Inbound messages are handed out on a
//! channel rather than through a callback.

pub mod memory;

use crate::signal::SignalMessage;
use async_trait::async_trait;
use roomcall_common::RoomId;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Not subscribed to room {0}")]
    NotSubscribed(RoomId),

    #[error("Could not encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Transport closed")]
    Closed,
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Subscribe to a room. A second subscription replaces the first.
    async fn subscribe(
        &self,
        room: &RoomId,
    ) -> Result<mpsc::UnboundedReceiver<SignalMessage>, TransportError>;

    async fn publish(&self, room: &RoomId, message: SignalMessage) -> Result<(), TransportError>;

    async fn unsubscribe(&self, room: &RoomId) -> Result<(), TransportError>;
}
