//! Wire protocol for the duplex chat socket.
//!
//! Frames are JSON envelopes: a `type` discriminator, a payload shaped by
//! the type, a server-assigned RFC3339 `timestamp`, and an optional
//! client-supplied `request_id` echoed back in error replies.
//!
//! Inbound decoding is two-stage: the envelope first (malformed JSON keeps
//! the connection and yields an `INVALID_MESSAGE` error frame), then the
//! payload for the dispatched type (`INVALID_PAYLOAD`). Unknown type
//! strings decode to [`ClientFrameKind::Unknown`] so the session can reply
//! `UNKNOWN_TYPE` instead of dropping the connection.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::repo::{MessageKind, RoomSummary, UserStatus, UserSummary};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
    #[error("payload does not match frame type: {0}")]
    Payload(serde_json::Error),
}

/// Stable error codes carried in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidPayload,
    NotMember,
    EmptyContent,
    SendFailed,
    UnknownType,
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Discriminator of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFrameKind {
    JoinRoom,
    LeaveRoom,
    SendMessage,
    Typing,
    MarkRead,
    Ping,
    #[serde(other)]
    Unknown,
}

/// An inbound envelope with its payload still undecoded.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: ClientFrameKind,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl InboundEnvelope {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)
    }

    /// Decodes the payload into the shape expected by the frame type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let payload = self.payload.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(payload).map_err(ProtocolError::Payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoomPayload {
    pub room_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRoomPayload {
    pub room_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub room_id: u64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub room_id: u64,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkReadPayload {
    pub room_id: u64,
    pub message_id: u64,
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Typed outbound frame. Serialized adjacently: `type` + `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    NewMessage(NewMessagePayload),
    MessageRead(MessageReadPayload),
    UserJoined(UserJoinedPayload),
    UserLeft(UserLeftPayload),
    UserTyping(UserTypingPayload),
    PresenceUpdate(PresencePayload),
    RoomJoined(RoomRef),
    RoomLeft(RoomRef),
    RoomInvited(RoomInvitedPayload),
    Error(ErrorPayload),
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    pub id: u64,
    pub room_id: u64,
    pub sender: UserSummary,
    pub content: String,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub unread_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReadPayload {
    pub room_id: u64,
    pub user_id: u64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserJoinedPayload {
    pub room_id: u64,
    pub user: UserSummary,
    pub member_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserLeftPayload {
    pub room_id: u64,
    pub user_id: u64,
    pub username: String,
    pub member_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTypingPayload {
    pub room_id: u64,
    pub user_id: u64,
    pub username: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: u64,
    pub status: UserStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoomRef {
    pub room_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInvitedPayload {
    pub room: RoomSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Complete outbound envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub frame: ServerFrame,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    /// Wraps a frame with the current server timestamp.
    pub fn new(frame: ServerFrame) -> Self {
        Self {
            frame,
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    /// Builds an `error` envelope echoing the originating request id.
    pub fn error(code: ErrorCode, message: impl Into<String>, request_id: Option<String>) -> Self {
        Self::new(ServerFrame::Error(ErrorPayload {
            code,
            message: message.into(),
            request_id,
        }))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Malformed)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_join_room_decodes() {
        let raw = br#"{"type":"join_room","payload":{"room_id":7},"request_id":"r-1"}"#;
        let envelope = InboundEnvelope::decode(raw).unwrap();
        assert_eq!(envelope.kind, ClientFrameKind::JoinRoom);
        assert_eq!(envelope.request_id.as_deref(), Some("r-1"));
        let payload: JoinRoomPayload = envelope.payload_as().unwrap();
        assert_eq!(payload.room_id, 7);
    }

    #[test]
    fn unknown_type_string_is_not_a_decode_error() {
        let raw = br#"{"type":"dance","payload":{}}"#;
        let envelope = InboundEnvelope::decode(raw).unwrap();
        assert_eq!(envelope.kind, ClientFrameKind::Unknown);
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(
            InboundEnvelope::decode(b"{nope"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn payload_shape_mismatch_is_a_payload_error() {
        let raw = br#"{"type":"join_room","payload":{"room_id":"seven"}}"#;
        let envelope = InboundEnvelope::decode(raw).unwrap();
        let result: Result<JoinRoomPayload, _> = envelope.payload_as();
        assert!(matches!(result, Err(ProtocolError::Payload(_))));
    }

    #[test]
    fn missing_payload_decodes_as_null() {
        let raw = br#"{"type":"ping"}"#;
        let envelope = InboundEnvelope::decode(raw).unwrap();
        assert_eq!(envelope.kind, ClientFrameKind::Ping);
        assert!(envelope.payload.is_none());
    }

    #[test]
    fn envelope_serializes_type_and_payload_side_by_side() {
        let envelope = Envelope::new(ServerFrame::RoomJoined(RoomRef { room_id: 7 }));
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "room_joined");
        assert_eq!(value["payload"]["room_id"], 7);
        assert!(value["timestamp"].is_string());
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn pong_has_no_payload_key() {
        let envelope = Envelope::new(ServerFrame::Pong);
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "pong");
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn error_envelope_echoes_request_id_in_payload() {
        let envelope = Envelope::error(
            ErrorCode::NotMember,
            "you are not a member of this room",
            Some("req-9".into()),
        );
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["code"], "NOT_MEMBER");
        assert_eq!(value["payload"]["request_id"], "req-9");
    }

    #[test]
    fn envelope_roundtrip() {
        let envelope = Envelope::new(ServerFrame::PresenceUpdate(PresencePayload {
            user_id: 42,
            status: UserStatus::Online,
        }));
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }
}
