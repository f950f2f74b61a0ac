//! Fuzz target for broadcast and command payload decoding.
//!
//! Tests that entity and command decoding never panics on arbitrary input.

#![no_main]

use crossync::boost::PlayerBoosts;
use crossync::entity::decode;
use crossync::CommandEnvelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(boosts) = decode::<PlayerBoosts>(data, "fuzz") {
        // Decoded entities always carry an id
        assert!(!crossync::Entity::id(&boosts).is_empty());
    }

    let _ = serde_json::from_slice::<CommandEnvelope>(data);
});
