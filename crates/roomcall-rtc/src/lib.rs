//! # roomcall-rtc
//!
//! Negotiation and lifecycle controller for peer-to-peer calls in a room.
//!
//! Peers exchange offers, answers and candidates over a per-room broadcast
//! channel ([`transport::SignalingTransport`]) before media flows directly
//! between them through a [`media::MediaEngine`]. This crate owns everything
//! in between:
//!
//! - [`router::SignalRouter`] filters inbound signals and dispatches them by sender
//! - [`session`] drives each peer connection through its state machine
//! - [`candidates::CandidateQueue`] holds candidates until they can be applied
//! - [`manager::CallManager`] is the API for the UI layer
//!
//! ```text
//!   transport ──▶ router ──▶ session task ──▶ media engine
//!                   │            │ ▲               │
//!                   ▼            ▼ └── engine events
//!                manager ◀── state reports
//! ```

pub mod candidates;
pub mod error;
pub mod manager;
pub mod media;
pub mod router;
pub mod session;
pub mod signal;
pub mod transport;

pub use error::{CallError, CallResult, ProtocolAnomaly};
pub use manager::{CallManager, IncomingCalls};
pub use media::{MediaConstraints, MediaEngine, MediaEngineFactory, MediaKind};
pub use session::{SessionEvent, SessionEvents, SessionHandle, SessionSnapshot, SessionState};
pub use signal::{Recipient, SignalKind, SignalMessage};
pub use transport::SignalingTransport;
