//! Protocol message definitions
//!
//! Defines the frames exchanged between chat clients and the broker.
//! Every frame is a JSON object carrying an `action` tag and an optional
//! `data` payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Current protocol version, reported in the welcome frame
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum length of room and member identifiers
pub const MAX_ID_LENGTH: usize = 128;

/// Maximum chat message length (64KB)
pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

/// Member identifier used for broker-originated room messages
pub const SERVER_MEMBER_ID: &str = "server";

/// Actions a client may send
pub const CLIENT_ACTIONS: &[&str] = &[
    "join-room",
    "message-room",
    "leave-room",
    "list-rooms",
    "ping",
];

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while decoding or validating an inbound frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Decode(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not a member of room {0}")]
    NotInRoom(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Decode(err.to_string())
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Payload of a `join-room` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct JoinRoomRequest {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub joiner_id: String,
}

/// Payload of a `message-room` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessageRoomRequest {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub member_id: String,
    #[serde(default)]
    pub message: String,
}

/// Payload of a `leave-room` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LeaveRoomRequest {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub member_id: String,
}

/// Frames sent from a client to the broker
///
/// Inbound frames are decoded through [`ClientMessage::decode`].
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "action", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room, creating it on demand
    JoinRoom(JoinRoomRequest),

    /// Fan a message out to every member of a room
    MessageRoom(MessageRoomRequest),

    /// Leave a previously joined room
    LeaveRoom(LeaveRoomRequest),

    /// List the rooms currently known to the broker
    ListRooms,

    /// Connection keepalive
    Ping {
        /// Sequence number echoed back in the pong
        seq: u64,
    },
}

/// Loose envelope used to tell unknown actions apart from malformed payloads
#[derive(Debug, Deserialize)]
struct RawFrame {
    action: Option<String>,
    #[serde(default)]
    data: Value,
}

fn payload<T: DeserializeOwned>(data: Value) -> ProtocolResult<T> {
    let data = match data {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    Ok(serde_json::from_value(data)?)
}

fn require(field: &str, value: &str, max: usize) -> ProtocolResult<()> {
    if value.is_empty() {
        return Err(ProtocolError::Validation(format!(
            "{} cannot be empty",
            field
        )));
    }
    if value.len() > max {
        return Err(ProtocolError::Validation(format!(
            "{} exceeds maximum length of {} bytes",
            field, max
        )));
    }
    Ok(())
}

impl ClientMessage {
    /// Decode a frame without validating its contents
    ///
    /// A missing or unrecognised `action` is reported as
    /// [`ProtocolError::UnknownAction`]; anything else that fails to parse
    /// is a [`ProtocolError::Decode`].
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let action = raw
            .action
            .ok_or_else(|| ProtocolError::Decode("missing field `action`".to_string()))?;

        match action.as_str() {
            "join-room" => Ok(ClientMessage::JoinRoom(payload(raw.data)?)),
            "message-room" => Ok(ClientMessage::MessageRoom(payload(raw.data)?)),
            "leave-room" => Ok(ClientMessage::LeaveRoom(payload(raw.data)?)),
            "list-rooms" => Ok(ClientMessage::ListRooms),
            "ping" => {
                #[derive(Deserialize)]
                struct Ping {
                    seq: u64,
                }
                let ping: Ping = payload(raw.data)?;
                Ok(ClientMessage::Ping { seq: ping.seq })
            }
            _ => Err(ProtocolError::UnknownAction(action)),
        }
    }

    /// Decode and validate a frame
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        let message = Self::decode(text)?;
        message.validate()?;
        Ok(message)
    }

    /// Serialize the frame to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::JoinRoom(req) => {
                require("room_id", &req.room_id, MAX_ID_LENGTH)?;
                require("joiner_id", &req.joiner_id, MAX_ID_LENGTH)
            }
            ClientMessage::MessageRoom(req) => {
                require("room_id", &req.room_id, MAX_ID_LENGTH)?;
                require("member_id", &req.member_id, MAX_ID_LENGTH)?;
                require("message", &req.message, MAX_MESSAGE_LENGTH)
            }
            ClientMessage::LeaveRoom(req) => {
                require("room_id", &req.room_id, MAX_ID_LENGTH)?;
                require("member_id", &req.member_id, MAX_ID_LENGTH)
            }
            ClientMessage::ListRooms => Ok(()),
            ClientMessage::Ping { .. } => Ok(()),
        }
    }

    /// Action tag of this frame, as it appears on the wire
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom(_) => "join-room",
            ClientMessage::MessageRoom(_) => "message-room",
            ClientMessage::LeaveRoom(_) => "leave-room",
            ClientMessage::ListRooms => "list-rooms",
            ClientMessage::Ping { .. } => "ping",
        }
    }

    /// Create a JoinRoom message
    pub fn join_room(room_id: impl Into<String>, joiner_id: impl Into<String>) -> Self {
        ClientMessage::JoinRoom(JoinRoomRequest {
            room_id: room_id.into(),
            joiner_id: joiner_id.into(),
        })
    }

    /// Create a MessageRoom message
    pub fn message_room(
        room_id: impl Into<String>,
        member_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ClientMessage::MessageRoom(MessageRoomRequest {
            room_id: room_id.into(),
            member_id: member_id.into(),
            message: message.into(),
        })
    }

    /// Create a LeaveRoom message
    pub fn leave_room(room_id: impl Into<String>, member_id: impl Into<String>) -> Self {
        ClientMessage::LeaveRoom(LeaveRoomRequest {
            room_id: room_id.into(),
            member_id: member_id.into(),
        })
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// A chat message delivered to room members
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMessage {
    pub room_id: String,
    pub member_id: String,
    pub message: String,
}

/// Membership change acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipChange {
    pub room_id: String,
    pub member_id: String,
    /// Members left in the room after the change
    pub member_count: usize,
}

/// Summary of a room for listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    /// Seeded from configuration and kept while empty
    pub persistent: bool,
    /// Distinct member identifiers, sorted
    pub members: Vec<String>,
    /// Number of member connections
    pub member_count: usize,
}

/// Frames sent from the broker to a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent once after the upgrade
    Welcome {
        version: u32,
        connection_id: Uuid,
        member_id: String,
    },

    /// Fan-out of a `message-room` request
    RoomMessage(RoomMessage),

    /// Acknowledges a `join-room` request
    RoomJoined(MembershipChange),

    /// Acknowledges a `leave-room` request
    RoomLeft(MembershipChange),

    /// Response to `list-rooms`
    RoomList { rooms: Vec<RoomInfo> },

    /// Response to `ping`
    Pong { seq: u64 },

    /// A frame was rejected
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame is not valid JSON or has the wrong shape
    DecodeError,
    /// Action tag not recognised
    UnknownAction,
    /// Required field missing, empty, or too long
    ValidationError,
    /// Leave requested for a room the connection is not in
    NotInRoom,
    /// Broker-side failure
    InternalError,
}

impl ServerMessage {
    /// Create a Welcome message
    pub fn welcome(connection_id: Uuid, member_id: impl Into<String>) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            connection_id,
            member_id: member_id.into(),
        }
    }

    /// Create a RoomMessage
    pub fn room_message(
        room_id: impl Into<String>,
        member_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServerMessage::RoomMessage(RoomMessage {
            room_id: room_id.into(),
            member_id: member_id.into(),
            message: message.into(),
        })
    }

    /// Create a RoomJoined acknowledgement
    pub fn room_joined(
        room_id: impl Into<String>,
        member_id: impl Into<String>,
        member_count: usize,
    ) -> Self {
        ServerMessage::RoomJoined(MembershipChange {
            room_id: room_id.into(),
            member_id: member_id.into(),
            member_count,
        })
    }

    /// Create a RoomLeft acknowledgement
    pub fn room_left(
        room_id: impl Into<String>,
        member_id: impl Into<String>,
        member_count: usize,
    ) -> Self {
        ServerMessage::RoomLeft(MembershipChange {
            room_id: room_id.into(),
            member_id: member_id.into(),
            member_count,
        })
    }

    /// Create a Pong message
    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    /// Create an Error message with code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Serialize the frame to JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a server frame from JSON (primarily for testing)
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<&ProtocolError> for ErrorCode {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::Decode(_) => ErrorCode::DecodeError,
            ProtocolError::UnknownAction(_) => ErrorCode::UnknownAction,
            ProtocolError::Validation(_) => ErrorCode::ValidationError,
            ProtocolError::NotInRoom(_) => ErrorCode::NotInRoom,
        }
    }
}

impl From<&ProtocolError> for ServerMessage {
    fn from(err: &ProtocolError) -> Self {
        ServerMessage::error_with_code(err.to_string(), err.into())
    }
}

// ============================================================================
// Tests
// ============================================================================
