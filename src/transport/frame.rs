// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire frame carrying the publisher identity alongside a payload.
//!
//! Redis pub/sub delivers bare bytes, so the origin travels in-band:
//!
//! ```text
//! ┌──────────────┬──────────────────────┬─────────────────┐
//! │ origin_len   │ origin (UTF-8)       │ payload         │
//! │ u16 BE       │ origin_len bytes     │ remaining bytes │
//! └──────────────┴──────────────────────┴─────────────────┘
//! ```

use crate::error::{Result, SyncError};

/// Longest origin identity that fits in a frame.
pub const MAX_ORIGIN_LEN: usize = u16::MAX as usize;

const HEADER_LEN: usize = 2;

/// Prefix `payload` with the origin header.
pub fn encode_frame(origin: &str, payload: &[u8]) -> Result<Vec<u8>> {
    if origin.len() > MAX_ORIGIN_LEN {
        return Err(SyncError::Frame(format!(
            "origin is {} bytes, limit is {}",
            origin.len(),
            MAX_ORIGIN_LEN
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + origin.len() + payload.len());
    frame.extend_from_slice(&(origin.len() as u16).to_be_bytes());
    frame.extend_from_slice(origin.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a frame into `(origin, payload)`.
pub fn decode_frame(frame: &[u8]) -> Result<(String, Vec<u8>)> {
    if frame.len() < HEADER_LEN {
        return Err(SyncError::Frame(format!("frame too short ({} bytes)", frame.len())));
    }

    let origin_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let body = &frame[HEADER_LEN..];
    if body.len() < origin_len {
        return Err(SyncError::Frame(format!(
            "origin length {} exceeds remaining {} bytes",
            origin_len,
            body.len()
        )));
    }

    let (origin, payload) = body.split_at(origin_len);
    let origin = std::str::from_utf8(origin)
        .map_err(|e| SyncError::Frame(format!("origin is not UTF-8: {}", e)))?;
    Ok((origin.to_string(), payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame("hub", b"{}").unwrap();
        assert_eq!(frame, vec![0, 3, b'h', b'u', b'b', b'{', b'}']);
    }

    #[test]
    fn test_decode_recovers_origin_and_payload() {
        let frame = encode_frame("survival-2", br#"{"id":"p1"}"#).unwrap();
        let (origin, payload) = decode_frame(&frame).unwrap();
        assert_eq!(origin, "survival-2");
        assert_eq!(payload, br#"{"id":"p1"}"#.to_vec());
    }

    #[test]
    fn test_empty_origin_and_payload() {
        let frame = encode_frame("", b"").unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), (String::new(), Vec::new()));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(matches!(decode_frame(&[]), Err(SyncError::Frame(_))));
        assert!(matches!(decode_frame(&[0]), Err(SyncError::Frame(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_origin() {
        let err = decode_frame(&[0, 10, b'a', b'b']).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8_origin() {
        let err = decode_frame(&[0, 2, 0xC3, 0x28, b'x']).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_encode_rejects_oversized_origin() {
        let origin = "x".repeat(MAX_ORIGIN_LEN + 1);
        assert!(encode_frame(&origin, b"").is_err());
    }
}
