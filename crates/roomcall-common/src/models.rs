//! Identity types for rooms, participants, and peer sessions.
//!
//! Room and user identifiers are opaque strings handed to us by the room
//! service and the identity layer. Session identifiers are generated locally
//! as UUID v7, so they sort by creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque room identifier (e.g. the six-letter code users share).
    RoomId
);

string_id!(
    /// Identity of a participant. Ordering is used for the glare tie-break.
    UserId
);

/// Locally generated identifier of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creation time, recovered from the v7 timestamp.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique_and_sortable() {
        let first = SessionId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = SessionId::generate();
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn test_session_id_created_at() {
        let before = Utc::now();
        let id = SessionId::generate();
        let after = Utc::now();

        let created = id.created_at().expect("should extract timestamp");
        assert!(created >= before - chrono::Duration::milliseconds(1));
        assert!(created <= after + chrono::Duration::milliseconds(1));
    }

    #[test]
    fn test_user_ids_order_lexicographically() {
        assert!(UserId::from("alice") < UserId::from("bob"));
        assert_eq!(UserId::new("alice").to_string(), "alice");
    }

    #[test]
    fn test_string_ids_serialize_transparently() {
        let json = serde_json::to_string(&RoomId::from("ABCDEF")).unwrap();
        assert_eq!(json, "\"ABCDEF\"");
    }
}
