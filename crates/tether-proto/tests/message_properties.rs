//! Property-based tests for message decoding.
//!
//! The decoder faces arbitrary client input, so it must reject garbage
//! without panicking, and the relay depends on opaque signaling fields
//! surviving a decode/encode pass untouched.

use proptest::prelude::*;
use serde_json::{Map, Value, json};
use tether_proto::{ClientMessage, MAX_ROOM_ID_LEN, ProtocolError, RoomId, ServerMessage, SessionId};

/// Strategy for valid room names
fn arbitrary_room() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 _-]{1,64}"
}

/// Strategy for JSON leaf values a browser might put in a candidate or SDP
fn arbitrary_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        ".{0,64}".prop_map(Value::from),
    ]
}

/// Strategy for the opaque part of a signal payload
fn arbitrary_fields() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-zA-Z]{1,12}", arbitrary_leaf(), 0..8).prop_map(|fields| {
        fields.into_iter().filter(|(key, _)| key != "room").collect()
    })
}

#[test]
fn prop_decode_never_panics() {
    proptest!(|(text in ".{0,512}")| {
        let _ = ClientMessage::decode(&text);
    });
}

#[test]
fn prop_decode_never_panics_on_near_valid_frames() {
    let kinds = ["request-join-room", "join-request-response", "offer", "answer", "ice-candidate", "leave-room"];

    proptest!(|(kind in prop::sample::select(kinds.to_vec()), data in arbitrary_leaf())| {
        let text = json!({"type": kind, "data": data}).to_string();
        let _ = ClientMessage::decode(&text);
    });
}

#[test]
fn prop_signal_fields_survive_relay() {
    proptest!(|(room in arbitrary_room(), fields in arbitrary_fields())| {
        let mut data = fields.clone();
        data.insert("room".to_string(), Value::from(room.clone()));
        let text = json!({"type": "answer", "data": data}).to_string();

        let decoded = ClientMessage::decode(&text).expect("valid answer frame");
        let ClientMessage::Answer(payload) = decoded else {
            return Err(TestCaseError::fail("decoded to wrong variant"));
        };

        // PROPERTY: only `room` is interpreted, everything else is kept
        prop_assert_eq!(payload.room.as_str(), room.as_str());
        prop_assert_eq!(&payload.fields, &fields);

        // PROPERTY: what the server relays carries the same JSON
        let relayed = ServerMessage::Answer(payload).encode().expect("encode");
        let reparsed: Value = serde_json::from_str(&relayed).expect("relayed frame is JSON");
        prop_assert_eq!(&reparsed["data"], &Value::Object(data));
    });
}

#[test]
fn signal_numbers_relay_with_original_spelling() {
    let text = r#"{"type":"offer","data":{"room":"r","big":123456789012345678901234567890,"f":1e2,"neg":-0.50}}"#;

    let ClientMessage::Offer(payload) = ClientMessage::decode(text).unwrap() else {
        panic!("decoded to wrong variant");
    };
    let relayed = ServerMessage::Offer(payload).encode().unwrap();

    assert!(relayed.contains(r#""big":123456789012345678901234567890"#), "{relayed}");
    assert!(relayed.contains(r#""f":1e2"#), "{relayed}");
    assert!(relayed.contains(r#""neg":-0.50"#), "{relayed}");
}

#[test]
fn prop_signal_number_text_survives_relay() {
    let number = prop_oneof![
        "-?[1-9][0-9]{19,40}",
        "-?[0-9]\\.[0-9]{1,20}",
        "[1-9][0-9]{0,3}[eE][+-]?[0-9]{1,3}",
    ];

    proptest!(|(number in number)| {
        let text = format!(r#"{{"type":"ice-candidate","data":{{"room":"r","n":{number}}}}}"#);

        let decoded = ClientMessage::decode(&text).expect("valid candidate frame");
        let ClientMessage::IceCandidate(payload) = decoded else {
            return Err(TestCaseError::fail("decoded to wrong variant"));
        };
        let relayed = ServerMessage::IceCandidate(payload).encode().expect("encode");

        // PROPERTY: the relayed number is byte-for-byte the one the client sent
        let expected = format!(r#""n":{number}"#);
        prop_assert!(relayed.contains(&expected), "{} not in {}", expected, relayed);
    });
}

#[test]
fn prop_session_id_text_form_is_stable() {
    proptest!(|(raw in any::<u64>())| {
        let id = SessionId::new(raw);
        let text = id.to_string();

        prop_assert_eq!(text.len(), 16);
        prop_assert_eq!(text.parse::<SessionId>(), Ok(id));
    });
}

#[test]
fn prop_room_id_length_limit() {
    proptest!(|(len in 0usize..(MAX_ROOM_ID_LEN * 2))| {
        let result = RoomId::new("r".repeat(len));

        if len == 0 || len > MAX_ROOM_ID_LEN {
            prop_assert!(matches!(result, Err(ProtocolError::InvalidRoomId { .. })), "unexpected accept at len {}", len);
        } else {
            prop_assert!(result.is_ok());
        }
    });
}
