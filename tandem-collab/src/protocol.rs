//! JSON wire protocol for room messages.
//!
//! Every frame is one JSON value:
//! ```text
//! object  { "type", "userId", "data", "timestamp" }   message envelope
//! array   [ { userId, username, color, cursor?, lastSeen }, … ]   presence snapshot
//! ```
//!
//! The `data` field is decoded into a [`Payload`] variant selected by `type`,
//! so call sites never inspect untyped JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::Presence;

/// User identity as carried on the wire.
pub type UserId = String;

/// Shared document body: field name to arbitrary JSON value.
pub type Document = BTreeMap<String, Value>;

/// Per-user edit counters.
pub type VectorClock = BTreeMap<UserId, u64>;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message types for the room protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// A peer announced itself in the room
    #[serde(rename = "user.joined")]
    UserJoined,
    /// A peer left the room
    #[serde(rename = "user.left")]
    UserLeft,
    /// Full shared-state snapshot
    #[serde(rename = "state.updated")]
    StateUpdated,
    /// Pointer position update
    #[serde(rename = "cursor.moved")]
    CursorMoved,
}

impl MessageType {
    /// Wire name, also used as the event name on session buses.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::UserJoined => "user.joined",
            MessageType::UserLeft => "user.left",
            MessageType::StateUpdated => "state.updated",
            MessageType::CursorMoved => "cursor.moved",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer position in the sender's viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

impl Cursor {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Display profile announced with `user.joined`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub color: String,
}

/// Shared state as broadcast with `state.updated`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state: Document,
    pub version: u64,
    #[serde(default)]
    pub vector_clock: VectorClock,
}

/// Type-specific message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    UserJoined(Profile),
    UserLeft,
    StateUpdated(StateSnapshot),
    CursorMoved(Cursor),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::UserJoined(_) => MessageType::UserJoined,
            Payload::UserLeft => MessageType::UserLeft,
            Payload::StateUpdated(_) => MessageType::StateUpdated,
            Payload::CursorMoved(_) => MessageType::CursorMoved,
        }
    }
}

/// Top-level room message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct Message {
    pub user_id: UserId,
    pub payload: Payload,
    /// Sender wall clock, epoch milliseconds
    pub timestamp: i64,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(user_id: impl Into<UserId>, payload: Payload) -> Self {
        Self {
            user_id: user_id.into(),
            payload,
            timestamp: now_ms(),
        }
    }

    pub fn user_joined(user_id: impl Into<UserId>, profile: Profile) -> Self {
        Self::new(user_id, Payload::UserJoined(profile))
    }

    pub fn user_left(user_id: impl Into<UserId>) -> Self {
        Self::new(user_id, Payload::UserLeft)
    }

    pub fn state_updated(user_id: impl Into<UserId>, snapshot: StateSnapshot) -> Self {
        Self::new(user_id, Payload::StateUpdated(snapshot))
    }

    pub fn cursor_moved(user_id: impl Into<UserId>, cursor: Cursor) -> Self {
        Self::new(user_id, Payload::CursorMoved(cursor))
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    ///
    /// A well-formed envelope whose `data` does not fit its `type` fails with
    /// [`ProtocolError::InvalidPayload`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Self::try_from(wire)
    }

    fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_value(value)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Self::try_from(wire)
    }
}

/// Envelope exactly as it appears on the wire.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    msg_type: MessageType,
    user_id: UserId,
    #[serde(default)]
    data: Value,
    timestamp: i64,
}

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let invalid = |e: serde_json::Error| ProtocolError::InvalidPayload {
            msg_type: wire.msg_type,
            reason: e.to_string(),
        };
        let payload = match wire.msg_type {
            MessageType::UserJoined => {
                // A bare join without a profile is still a join.
                if wire.data.is_null() {
                    Payload::UserJoined(Profile::default())
                } else {
                    Payload::UserJoined(serde_json::from_value(wire.data.clone()).map_err(invalid)?)
                }
            }
            MessageType::UserLeft => Payload::UserLeft,
            MessageType::StateUpdated => {
                Payload::StateUpdated(serde_json::from_value(wire.data.clone()).map_err(invalid)?)
            }
            MessageType::CursorMoved => {
                Payload::CursorMoved(serde_json::from_value(wire.data.clone()).map_err(invalid)?)
            }
        };
        Ok(Message {
            user_id: wire.user_id,
            payload,
            timestamp: wire.timestamp,
        })
    }
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        let msg_type = msg.payload.message_type();
        let data = match msg.payload {
            Payload::UserJoined(profile) => serde_json::to_value(profile),
            Payload::UserLeft => Ok(Value::Null),
            Payload::StateUpdated(snapshot) => serde_json::to_value(snapshot),
            Payload::CursorMoved(cursor) => serde_json::to_value(cursor),
        };
        WireMessage {
            msg_type,
            user_id: msg.user_id,
            data: data.unwrap_or(Value::Null),
            timestamp: msg.timestamp,
        }
    }
}

/// Join handshake, sent once per successful connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinHandshake {
    pub room_id: String,
    pub user_id: UserId,
}

impl JoinHandshake {
    pub fn new(room_id: impl Into<String>, user_id: impl Into<UserId>) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Inbound frame, classified by its JSON shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Authoritative roster pushed by the endpoint
    Presence(Vec<Presence>),
    Message(Message),
}

impl Frame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        match value {
            Value::Array(_) => serde_json::from_value(value)
                .map(Frame::Presence)
                .map_err(|e| ProtocolError::Deserialization(e.to_string())),
            Value::Object(_) => Message::from_value(value).map(Frame::Message),
            _ => Err(ProtocolError::UnexpectedFrame),
        }
    }
}

/// Encode a presence roster as a snapshot frame.
pub fn encode_roster(users: &[Presence]) -> Result<String, ProtocolError> {
    serde_json::to_string(users).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid {msg_type} payload: {reason}")]
    InvalidPayload { msg_type: MessageType, reason: String },
    #[error("frame is neither a message nor a presence snapshot")]
    UnexpectedFrame,
}
