//! The on-wire envelope format shared by a zio reader and writer:
//!
//! ```text
//! { "<name>": { "data": "<base64>", "eof": true? } }
//! ```
//!
//! `data` is omitted when the payload is empty, `eof` is omitted when false.
//! A well-formed envelope has exactly one top-level key; [`decode`] rejects
//! anything else.

use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::{Deserialize, Serialize};

mod error;

pub use error::CodecError;

#[derive(Serialize, Deserialize)]
struct Body {
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eof: Option<bool>,
}

/// A decoded envelope: the name it was addressed to, its payload, and
/// whether it carries the end-of-stream flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub name: String,
    pub data: Vec<u8>,
    pub eof: bool,
}

/// Encodes `payload` as an envelope addressed to `name`, optionally setting
/// the `eof` flag. Returns the serialized JSON bytes.
pub fn encode(name: &str, payload: &[u8], eof: bool) -> Result<Vec<u8>, CodecError> {
    let body = Body {
        data: (!payload.is_empty()).then(|| BASE64_STANDARD.encode(payload)),
        eof: eof.then_some(true),
    };
    let mut envelope = HashMap::with_capacity(1);
    envelope.insert(name, body);
    serde_json::to_vec(&envelope).map_err(CodecError::from)
}

/// Decodes a wire envelope, failing unless it carries exactly one top-level
/// key and (when present) well-formed base64 `data`.
pub fn decode(bytes: &[u8]) -> Result<Decoded, CodecError> {
    let envelope: HashMap<String, Body> = serde_json::from_slice(bytes)?;
    if envelope.len() != 1 {
        return Err(CodecError::MalformedEnvelope);
    }
    let (name, body) = envelope.into_iter().next().expect("checked len == 1");
    let data = match body.data {
        Some(encoded) => BASE64_STANDARD.decode(encoded)?,
        None => Vec::new(),
    };
    Ok(Decoded {
        name,
        data,
        eof: body.eof.unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffered_echo_scenario() {
        let first = encode("out", b"hi\n", false).unwrap();
        assert_eq!(first, br#"{"out":{"data":"aGkK"}}"#);

        let second = encode("out", b"there", true).unwrap();
        assert_eq!(second, br#"{"out":{"data":"dGhlcmU=","eof":true}}"#);
    }

    #[test]
    fn binary_block_scenario() {
        let envelope = encode("x", &[0x00, 0xFF, 0x10], true).unwrap();
        assert_eq!(envelope, br#"{"x":{"data":"AP8Q","eof":true}}"#);
    }

    #[test]
    fn eof_only_frame_omits_data() {
        let envelope = encode("x", &[], true).unwrap();
        assert_eq!(envelope, br#"{"x":{"eof":true}}"#);
        let decoded = decode(&envelope).unwrap();
        assert_eq!(decoded.name, "x");
        assert!(decoded.data.is_empty());
        assert!(decoded.eof);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let envelope = encode("in", b"payload", false).unwrap();
        let decoded = decode(&envelope).unwrap();
        assert_eq!(decoded.name, "in");
        assert_eq!(decoded.data, b"payload");
        assert!(!decoded.eof);
    }

    #[test]
    fn rejects_multiple_top_level_keys() {
        let err = decode(br#"{"a":{"data":"YQ=="},"b":{"data":"Yg=="}}"#).unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope));
    }

    #[test]
    fn rejects_empty_object() {
        let err = decode(b"{}").unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope));
    }

    #[test]
    fn rejects_bad_base64() {
        let err = decode(br#"{"x":{"data":"not base64!!"}}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidBase64(_)));
    }
}
