//! JSON signaling messages exchanged over the WebSocket.
//!
//! Inbound messages are parsed into [`ClientMessage`]. Session descriptions
//! and ICE candidates stay as raw JSON text ([`RawValue`]) so the relay can
//! forward them byte for byte without interpreting them.

use crate::types::{ClientId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Wire tag of an SDP offer.
pub const TYPE_OFFER: &str = "offer";
/// Wire tag of an SDP answer.
pub const TYPE_ANSWER: &str = "answer";
/// Wire tag of a trickled ICE candidate.
pub const TYPE_ICE_CANDIDATE: &str = "ice_candidate";
/// Wire tag of a membership request.
pub const TYPE_GET_USERS: &str = "get_users";
/// Wire tag of a membership list pushed by the relay.
pub const TYPE_USER_LIST: &str = "user_list";

/// The three peer-to-peer signal kinds the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// Connectivity candidate.
    IceCandidate,
}

impl SignalKind {
    /// Value of the `type` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => TYPE_OFFER,
            Self::Answer => TYPE_ANSWER,
            Self::IceCandidate => TYPE_ICE_CANDIDATE,
        }
    }

    /// Name of the field carrying the opaque payload.
    #[must_use]
    pub const fn payload_field(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "candidate",
        }
    }
}

impl Serialize for SignalKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A parsed client-to-relay message.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// A signal addressed to another client.
    Signal {
        /// Which signal this is.
        kind: SignalKind,
        /// Identity of the intended recipient.
        target: ClientId,
        /// Opaque payload, kept verbatim.
        payload: Box<RawValue>,
    },
    /// Request for the current room membership.
    GetUsers,
}

/// Errors that can occur while parsing an inbound message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The text is not a JSON object.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The object has no `type` field.
    #[error("message has no type")]
    MissingType,
    /// The `type` field names no known message.
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    /// A field required by the message type is absent or null.
    #[error("{kind} message is missing required field {field:?}")]
    MissingField {
        /// Message type being parsed.
        kind: &'static str,
        /// Name of the absent field.
        field: &'static str,
    },
    /// The `target` field is an empty string.
    #[error("{0} message has an empty target")]
    EmptyTarget(&'static str),
}

impl ProtocolError {
    /// Short label used for metrics and logs.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingType => "missing_type",
            Self::UnknownType(_) => "unknown_type",
            Self::MissingField { .. } | Self::EmptyTarget(_) => "missing_field",
        }
    }
}

/// Permissive view of an inbound object. Unknown fields are ignored.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    target: Option<String>,
    offer: Option<Box<RawValue>>,
    answer: Option<Box<RawValue>>,
    candidate: Option<Box<RawValue>>,
}

impl ClientMessage {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for anything that is not a well-formed
    /// message of a known type carrying its required fields.
    ///
    /// ```
    /// use rdv_common::signal::{ClientMessage, SignalKind};
    /// let msg = ClientMessage::parse(r#"{"type":"offer","target":"b","offer":{"sdp":"v=0"}}"#).unwrap();
    /// match msg {
    ///     ClientMessage::Signal { kind, payload, .. } => {
    ///         assert_eq!(kind, SignalKind::Offer);
    ///         assert_eq!(payload.get(), r#"{"sdp":"v=0"}"#);
    ///     }
    ///     ClientMessage::GetUsers => unreachable!(),
    /// }
    /// ```
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let env: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = env.kind.ok_or(ProtocolError::MissingType)?;

        let (kind, payload) = match kind.as_str() {
            TYPE_GET_USERS => return Ok(Self::GetUsers),
            TYPE_OFFER => (SignalKind::Offer, env.offer),
            TYPE_ANSWER => (SignalKind::Answer, env.answer),
            TYPE_ICE_CANDIDATE => (SignalKind::IceCandidate, env.candidate),
            _ => return Err(ProtocolError::UnknownType(kind)),
        };

        let target = env.target.ok_or(ProtocolError::MissingField {
            kind: kind.as_str(),
            field: "target",
        })?;
        if target.is_empty() {
            return Err(ProtocolError::EmptyTarget(kind.as_str()));
        }
        let payload = payload.ok_or(ProtocolError::MissingField {
            kind: kind.as_str(),
            field: kind.payload_field(),
        })?;

        Ok(Self::Signal {
            kind,
            target: ClientId::from(target),
            payload,
        })
    }
}

/// A signal as delivered to its target, tagged with the sender.
#[derive(Debug, Serialize)]
pub struct Forwarded<'a> {
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    offer: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate: Option<&'a RawValue>,
    from: &'a ClientId,
}

impl<'a> Forwarded<'a> {
    /// Wraps `payload` for delivery on behalf of `from`.
    #[must_use]
    pub fn new(kind: SignalKind, payload: &'a RawValue, from: &'a ClientId) -> Self {
        let mut fwd = Self {
            kind,
            offer: None,
            answer: None,
            candidate: None,
            from,
        };
        match kind {
            SignalKind::Offer => fwd.offer = Some(payload),
            SignalKind::Answer => fwd.answer = Some(payload),
            SignalKind::IceCandidate => fwd.candidate = Some(payload),
        }
        fwd
    }

    /// Encodes the message as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Fails only if the serializer does; raw payloads are written as-is.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Membership list pushed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    /// Other members of the room, never including the recipient.
    pub users: Vec<ClientId>,
    /// Room the list describes.
    pub room_id: RoomId,
}

#[derive(Serialize)]
struct TaggedUserList<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    list: &'a UserList,
}

impl UserList {
    /// Encodes the list as a `user_list` JSON text frame.
    ///
    /// # Errors
    ///
    /// Fails only if the serializer does.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&TaggedUserList {
            kind: TYPE_USER_LIST,
            list: self,
        })
    }
}
