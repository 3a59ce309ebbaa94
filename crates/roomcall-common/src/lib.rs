//! # roomcall-common
//!
//! Identifiers and configuration shared by the roomcall crates.
//! No negotiation logic lives here, just primitives and contracts.

pub mod config;
pub mod models;

pub use models::{RoomId, SessionId, UserId};
