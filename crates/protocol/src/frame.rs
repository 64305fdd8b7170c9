//! Frame channel binary envelope used on the WebRTC `"frames"` data channel
//! (and, as a degraded fallback, inlined as base64 in a `frame` signaling
//! message).
//!
//! ```text
//! [utf8 json header][0x00][binary payload]
//! ```
//!
//! The header is `{"width":W,"height":H,"format":"image/png"}`. The
//! delimiter is exactly one zero byte — the first `0x00` byte in the buffer
//! marks the end of the header, so the header itself must never contain one
//! (JSON text never does) and the payload may contain arbitrary bytes after
//! that point, including further zero bytes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEnvelopeError {
    #[error("no delimiter byte found in envelope")]
    MissingDelimiter,
    #[error("header is not valid UTF-8")]
    InvalidUtf8,
    #[error("header failed to parse as JSON: {0}")]
    InvalidJson(String),
}

impl FrameHeader {
    /// Encode `(header, payload)` into a single envelope buffer.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let header_json = serde_json::to_vec(self).expect("FrameHeader serializes infallibly");
        let mut buf = Vec::with_capacity(header_json.len() + 1 + payload.len());
        buf.extend_from_slice(&header_json);
        buf.push(0u8);
        buf.extend_from_slice(payload);
        buf
    }

    /// Split an envelope buffer back into `(header, payload)`. The payload is
    /// borrowed from the input so no copy is made on the hot path.
    pub fn decode(buf: &[u8]) -> Result<(FrameHeader, &[u8]), FrameEnvelopeError> {
        let delim = buf
            .iter()
            .position(|&b| b == 0u8)
            .ok_or(FrameEnvelopeError::MissingDelimiter)?;
        let (header_bytes, rest) = buf.split_at(delim);
        let payload = &rest[1..];
        let header_str =
            std::str::from_utf8(header_bytes).map_err(|_| FrameEnvelopeError::InvalidUtf8)?;
        let header: FrameHeader = serde_json::from_str(header_str)
            .map_err(|e| FrameEnvelopeError::InvalidJson(e.to_string()))?;
        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(width: u32, height: u32) -> FrameHeader {
        FrameHeader { width, height, format: "image/png".to_string() }
    }

    #[test]
    fn round_trip_nonempty_payload() {
        let h = header(1920, 1080);
        let payload = vec![1u8, 2, 3, 4, 5];
        let buf = h.encode(&payload);
        let (parsed_header, parsed_payload) = FrameHeader::decode(&buf).unwrap();
        assert_eq!(parsed_header, h);
        assert_eq!(parsed_payload, payload.as_slice());
    }

    #[test]
    fn round_trip_empty_payload() {
        let h = header(640, 480);
        let buf = h.encode(&[]);
        let (parsed_header, parsed_payload) = FrameHeader::decode(&buf).unwrap();
        assert_eq!(parsed_header, h);
        assert!(parsed_payload.is_empty());
    }

    #[test]
    fn payload_may_contain_zero_bytes_after_delimiter() {
        let h = header(100, 100);
        let payload = vec![0u8, 1, 0u8, 2];
        let buf = h.encode(&payload);
        let (_, parsed_payload) = FrameHeader::decode(&buf).unwrap();
        assert_eq!(parsed_payload, payload.as_slice());
    }

    #[test]
    fn decode_rejects_missing_delimiter() {
        let buf = br#"{"width":1,"height":1,"format":"image/png"}"#.to_vec();
        assert_eq!(FrameHeader::decode(&buf), Err(FrameEnvelopeError::MissingDelimiter));
    }

    #[test]
    fn decode_rejects_malformed_header_json() {
        let mut buf = b"{not json".to_vec();
        buf.push(0u8);
        buf.extend_from_slice(b"payload");
        match FrameHeader::decode(&buf) {
            Err(FrameEnvelopeError::InvalidJson(_)) => {}
            other => panic!("expected InvalidJson, got {other:?}"),
        }
    }

    #[test]
    fn first_zero_byte_is_always_the_delimiter_even_if_header_parse_would_succeed_later() {
        // A header followed by a zero byte, then more zero bytes in the
        // payload, must still split at the *first* zero byte.
        let h = header(10, 20);
        let payload = vec![0u8, 0u8, 0u8];
        let buf = h.encode(&payload);
        let (parsed_header, parsed_payload) = FrameHeader::decode(&buf).unwrap();
        assert_eq!(parsed_header, h);
        assert_eq!(parsed_payload, payload.as_slice());
    }
}
