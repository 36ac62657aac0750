//! Client and server message vocabulary.
//!
//! Every frame is one JSON document of the form
//! `{"type": "<kebab-case-name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    errors::{ProtocolError, Result},
    ids::{RoomId, SessionId},
};

/// Maximum accepted size of an inbound frame in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Ask to join (or create) a room.
    RequestJoinRoom(RoomId),
    /// The room authority's decision on a pending request.
    JoinRequestResponse(JoinResponse),
    /// Session description offer, relayed verbatim.
    Offer(SignalPayload),
    /// Session description answer, relayed verbatim.
    Answer(SignalPayload),
    /// Network reachability candidate, relayed verbatim.
    IceCandidate(SignalPayload),
    /// Leave a room (or cancel a pending request for it).
    LeaveRoom(RoomId),
}

impl ClientMessage {
    /// Decode one inbound text frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MessageTooLarge` if the frame exceeds [`MAX_MESSAGE_SIZE`]
    /// - `ProtocolError::Malformed` if the frame is not a known message
    pub fn decode(text: &str) -> Result<Self> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge { size: text.len(), max: MAX_MESSAGE_SIZE });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Only fails if an opaque signaling field cannot be serialized, which
    /// does not happen for values that came from JSON.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short message name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestJoinRoom(_) => "request-join-room",
            Self::JoinRequestResponse(_) => "join-request-response",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::LeaveRoom(_) => "leave-room",
        }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First message on every connection: the client's own identifier.
    SessionAssigned(SessionId),
    /// The requester is now a member of the room.
    RoomJoined(RoomJoined),
    /// Sent to the room authority when someone asks to join.
    JoinRequestReceived(JoinRequest),
    /// Acknowledges a request that now waits on the authority.
    AwaitingCreatorApproval(RoomNotice),
    /// The request was refused, timed out, or the room vanished.
    JoinDeclined(RoomNotice),
    /// The recipient now holds authority for the room.
    YouAreCreator(RoomRef),
    /// Relayed offer.
    Offer(SignalPayload),
    /// Relayed answer.
    Answer(SignalPayload),
    /// Relayed candidate.
    IceCandidate(SignalPayload),
    /// A peer joined one of the recipient's rooms.
    UserJoined(SessionId),
    /// A peer left one of the recipient's rooms.
    UserLeft(SessionId),
    /// A session disconnected from the server.
    UserDisconnected(SessionId),
    /// The last inbound frame could not be processed.
    Error(ErrorPayload),
}

impl ServerMessage {
    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Only fails if an opaque signaling field cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a server frame. Used by clients and tests.
    ///
    /// # Errors
    ///
    /// `ProtocolError::Malformed` if the frame is not a known message.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short message name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionAssigned(_) => "session-assigned",
            Self::RoomJoined(_) => "room-joined",
            Self::JoinRequestReceived(_) => "join-request-received",
            Self::AwaitingCreatorApproval(_) => "awaiting-creator-approval",
            Self::JoinDeclined(_) => "join-declined",
            Self::YouAreCreator(_) => "you-are-creator",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::UserJoined(_) => "user-joined",
            Self::UserLeft(_) => "user-left",
            Self::UserDisconnected(_) => "user-disconnected",
            Self::Error(_) => "error",
        }
    }
}

/// Authority's answer to a join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    /// Room the request was for
    pub room_id: RoomId,
    /// Session that asked to join
    pub requester_id: SessionId,
    /// Whether the requester is admitted
    pub accepted: bool,
}

/// Forwarded join request, sent to the authority only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Room being joined
    pub room_id: RoomId,
    /// Session asking to join
    pub requester_id: SessionId,
}

/// Admission notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    /// Room joined
    pub room_id: RoomId,
    /// Whether the recipient is the room's authority
    pub is_creator: bool,
    /// Human-readable status
    pub message: String,
}

/// Room identifier plus a human-readable status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomNotice {
    /// Room concerned
    pub room_id: RoomId,
    /// Human-readable status
    pub message: String,
}

/// Bare room reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    /// Room concerned
    pub room_id: RoomId,
}

/// Opaque handshake payload.
///
/// Only `room` is interpreted. Every other field is kept as raw JSON and
/// re-emitted unchanged when the payload is relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    /// Target room
    pub room: RoomId,
    /// Everything else the sender put in the payload
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl SignalPayload {
    /// Payload with no opaque fields.
    pub fn new(room: RoomId) -> Self {
        Self { room, fields: Map::new() }
    }

    /// Add an opaque field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Reply to a frame that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code
    pub code: u16,
    /// Human-readable description
    pub message: String,
}

impl ErrorPayload {
    /// Frame was not valid JSON or not a known message.
    pub const INVALID_MESSAGE: u16 = 1;
    /// Frame exceeded [`MAX_MESSAGE_SIZE`].
    pub const MESSAGE_TOO_LARGE: u16 = 2;
}

impl From<&ProtocolError> for ErrorPayload {
    fn from(err: &ProtocolError) -> Self {
        let code = match err {
            ProtocolError::MessageTooLarge { .. } => Self::MESSAGE_TOO_LARGE,
            _ => Self::INVALID_MESSAGE,
        };
        Self { code, message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn room(name: &str) -> RoomId {
        RoomId::new(name).unwrap()
    }

    #[test]
    fn request_join_room_decodes_bare_room_id() {
        let msg = ClientMessage::decode(r#"{"type":"request-join-room","data":"lobby"}"#).unwrap();
        assert_eq!(msg, ClientMessage::RequestJoinRoom(room("lobby")));
    }

    #[test]
    fn join_response_uses_camel_case_fields() {
        let msg = ClientMessage::decode(
            r#"{"type":"join-request-response","data":{"roomId":"lobby","requesterId":"000000000000000b","accepted":true}}"#,
        )
        .unwrap();

        assert_eq!(
            msg,
            ClientMessage::JoinRequestResponse(JoinResponse {
                room_id: room("lobby"),
                requester_id: SessionId::new(0xb),
                accepted: true,
            })
        );
    }

    #[test]
    fn signal_payload_keeps_opaque_fields() {
        let text = r#"{"type":"offer","data":{"room":"lobby","sdp":"v=0","meta":{"n":[1,2]}}}"#;
        let ClientMessage::Offer(payload) = ClientMessage::decode(text).unwrap() else {
            panic!("expected offer");
        };

        assert_eq!(payload.room, room("lobby"));
        assert_eq!(payload.fields.get("sdp"), Some(&json!("v=0")));
        assert_eq!(payload.fields.get("meta"), Some(&json!({"n": [1, 2]})));
    }

    #[test]
    fn relayed_signal_encodes_verbatim() {
        let payload = SignalPayload::new(room("lobby"))
            .with_field("candidate", json!("candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host"))
            .with_field("sdpMid", json!("0"));
        let encoded = ServerMessage::IceCandidate(payload).encode().unwrap();

        insta::assert_snapshot!(encoded, @r#"{"type":"ice-candidate","data":{"room":"lobby","candidate":"candidate:1 1 udp 2122260223 10.0.0.1 5000 typ host","sdpMid":"0"}}"#);
    }

    #[test]
    fn room_joined_wire_format() {
        let encoded = ServerMessage::RoomJoined(RoomJoined {
            room_id: room("lobby"),
            is_creator: true,
            message: "room created".to_string(),
        })
        .encode()
        .unwrap();

        insta::assert_snapshot!(encoded, @r#"{"type":"room-joined","data":{"roomId":"lobby","isCreator":true,"message":"room created"}}"#);
    }

    #[test]
    fn join_request_received_wire_format() {
        let encoded = ServerMessage::JoinRequestReceived(JoinRequest {
            room_id: room("lobby"),
            requester_id: SessionId::new(0x2a),
        })
        .encode()
        .unwrap();

        insta::assert_snapshot!(encoded, @r#"{"type":"join-request-received","data":{"roomId":"lobby","requesterId":"000000000000002a"}}"#);
    }

    #[test]
    fn presence_wire_format() {
        let joined = ServerMessage::UserJoined(SessionId::new(7)).encode().unwrap();
        let left = ServerMessage::UserLeft(SessionId::new(7)).encode().unwrap();
        let assigned = ServerMessage::SessionAssigned(SessionId::new(7)).encode().unwrap();

        insta::assert_snapshot!(joined, @r#"{"type":"user-joined","data":"0000000000000007"}"#);
        insta::assert_snapshot!(left, @r#"{"type":"user-left","data":"0000000000000007"}"#);
        insta::assert_snapshot!(assigned, @r#"{"type":"session-assigned","data":"0000000000000007"}"#);
    }

    #[test]
    fn you_are_creator_wire_format() {
        let encoded = ServerMessage::YouAreCreator(RoomRef { room_id: room("lobby") }).encode().unwrap();

        insta::assert_snapshot!(encoded, @r#"{"type":"you-are-creator","data":{"roomId":"lobby"}}"#);
    }

    #[test]
    fn error_wire_format() {
        let err = ProtocolError::MessageTooLarge { size: 70_000, max: MAX_MESSAGE_SIZE };
        let encoded = ServerMessage::Error(ErrorPayload::from(&err)).encode().unwrap();

        insta::assert_snapshot!(encoded, @r#"{"type":"error","data":{"code":2,"message":"message too large: 70000 bytes (max 65536)"}}"#);
    }

    #[test]
    fn oversize_frame_rejected_before_parsing() {
        let text = format!(
            r#"{{"type":"offer","data":{{"room":"lobby","sdp":"{}"}}}}"#,
            "x".repeat(MAX_MESSAGE_SIZE)
        );

        assert!(matches!(
            ClientMessage::decode(&text),
            Err(ProtocolError::MessageTooLarge { max: MAX_MESSAGE_SIZE, .. })
        ));
    }

    #[test]
    fn unknown_type_is_malformed() {
        let result = ClientMessage::decode(r#"{"type":"teleport","data":"lobby"}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn empty_room_id_is_rejected() {
        let result = ClientMessage::decode(r#"{"type":"leave-room","data":""}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(reason)) if reason.contains("invalid room id")));
    }

    #[test]
    fn signal_without_room_is_rejected() {
        let result = ClientMessage::decode(r#"{"type":"answer","data":{"sdp":"v=0"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn server_messages_decode_for_clients() {
        let decoded = ServerMessage::decode(r#"{"type":"join-declined","data":{"roomId":"lobby","message":"declined"}}"#).unwrap();

        assert_eq!(
            decoded,
            ServerMessage::JoinDeclined(RoomNotice { room_id: room("lobby"), message: "declined".to_string() })
        );
    }
}
