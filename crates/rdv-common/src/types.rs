//! Core type definitions and protocol constants for the rendezvous relay.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Room every client lands in when no known room is requested.
pub const DEFAULT_ROOM: &str = "default";

/// Maximum length of a room identifier in bytes.
pub const MAX_ROOM_ID_LEN: usize = 64;

/// Query parameter on the WebSocket URL that selects a room.
pub const ROOM_QUERY_PARAM: &str = "room";

/// Prefix of the human-readable label derived from a client identity.
pub const LABEL_PREFIX: &str = "peer-";

/// Opaque server-assigned identity of one connected client.
///
/// Serialized as a plain JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Borrows the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display label for logs: `peer-` followed by the first eight characters.
    ///
    /// ```
    /// use rdv_common::ClientId;
    /// let id = ClientId::from("0123456789abcdef");
    /// assert_eq!(id.label(), "peer-01234567");
    /// ```
    #[must_use]
    pub fn label(&self) -> String {
        let short: String = self.0.chars().take(8).collect();
        format!("{LABEL_PREFIX}{short}")
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identifier of a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// The reserved default room.
    #[must_use]
    pub fn default_room() -> Self {
        Self(DEFAULT_ROOM.to_owned())
    }

    /// Generates a fresh random room identifier (simple UUID form).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns `true` for the reserved default room.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_ROOM
    }

    /// Borrows the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Borrow<str> for RoomId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Checks that a room identifier is non-empty, at most [`MAX_ROOM_ID_LEN`]
/// bytes, and made only of ASCII alphanumerics, `-` and `_`.
///
/// ```
/// use rdv_common::types::is_valid_room_id;
/// assert!(is_valid_room_id("team-42"));
/// assert!(!is_valid_room_id("a room"));
/// ```
#[must_use]
pub fn is_valid_room_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ROOM_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
