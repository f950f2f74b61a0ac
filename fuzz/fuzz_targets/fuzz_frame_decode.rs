//! Fuzz target for wire frame decoding.
//!
//! Frames arrive from any process sharing the Redis, so decoding must
//! reject garbage without panicking.

#![no_main]

use crossync::transport::{decode_frame, encode_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Should never panic
    if let Ok((origin, payload)) = decode_frame(data) {
        // Anything that decodes re-encodes to the same bytes
        let reencoded = encode_frame(&origin, &payload).expect("decoded origin fits");
        assert_eq!(reencoded, data);
    }
});
