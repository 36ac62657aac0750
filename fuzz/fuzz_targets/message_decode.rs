//! Fuzz target for ClientMessage::decode
//!
//! Feeds arbitrary text to the client message decoder to find:
//! - Panics in envelope or payload parsing
//! - Room or session identifiers that bypass validation
//! - Signal payloads that do not survive a relay round trip
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_proto::{ClientMessage, MAX_ROOM_ID_LEN, ServerMessage};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let Ok(message) = ClientMessage::decode(text) else {
        return;
    };

    let relayed = match message {
        ClientMessage::RequestJoinRoom(room) | ClientMessage::LeaveRoom(room) => {
            assert!(!room.as_str().is_empty());
            assert!(room.as_str().len() <= MAX_ROOM_ID_LEN);
            return;
        },
        ClientMessage::JoinRequestResponse(_) => return,
        ClientMessage::Offer(payload) => ServerMessage::Offer(payload),
        ClientMessage::Answer(payload) => ServerMessage::Answer(payload),
        ClientMessage::IceCandidate(payload) => ServerMessage::IceCandidate(payload),
    };

    // Whatever a client sends must reach peers unchanged
    let encoded = relayed.encode().expect("decoded payload must re-encode");
    let decoded = ServerMessage::decode(&encoded).expect("relayed message must decode");
    assert_eq!(decoded, relayed);
});
