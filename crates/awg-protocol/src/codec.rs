//! `vpn://` client link codec
//!
//! Link layout: `vpn://` + base64url (no padding) of
//! `[u32 big-endian JSON length][zlib(JSON)]`. The length header is the
//! format's only integrity check and is always verified on decode.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::io::{Read, Write};

use crate::error::{ProtocolError, Result};

/// URI scheme prefix of client links
pub const LINK_SCHEME: &str = "vpn://";

/// zlib level used for the payload
pub const COMPRESSION_LEVEL: u32 = 8;

const LENGTH_HEADER_LEN: usize = 4;

/// Serialize to the canonical JSON text used inside links.
///
/// Pretty printed with four-space indentation; key order follows struct
/// declaration order (and `BTreeMap` order for parameter blocks), so the
/// same logical value always yields the same bytes.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let mut buf = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    String::from_utf8(buf).map_err(|e| ProtocolError::CorruptPayload(e.to_string()))
}

/// Encode a value as a `vpn://` link
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = to_canonical_json(value)?;
    encode_json(&json)
}

/// Encode already-rendered JSON text as a `vpn://` link
pub fn encode_json(json: &str) -> Result<String> {
    let bytes = json.as_bytes();
    let length = u32::try_from(bytes.len()).map_err(|_| {
        ProtocolError::CorruptPayload(format!("payload too large: {} bytes", bytes.len()))
    })?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    encoder.write_all(bytes)?;
    let compressed = encoder.finish()?;

    let mut payload = Vec::with_capacity(LENGTH_HEADER_LEN + compressed.len());
    payload.extend_from_slice(&length.to_be_bytes());
    payload.extend_from_slice(&compressed);

    Ok(format!("{LINK_SCHEME}{}", URL_SAFE_NO_PAD.encode(payload)))
}

/// Decode a link into its verified JSON bytes.
///
/// Accepts the link with or without the `vpn://` prefix and with or
/// without trailing `=` padding.
pub fn decode_json(uri: &str) -> Result<Vec<u8>> {
    let encoded = uri.trim();
    let encoded = encoded.strip_prefix(LINK_SCHEME).unwrap_or(encoded);
    let encoded = encoded.trim_end_matches('=');

    let payload = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ProtocolError::CorruptPayload(format!("invalid base64: {e}")))?;

    if payload.len() < LENGTH_HEADER_LEN {
        return Err(ProtocolError::CorruptPayload(format!(
            "payload is {} bytes, shorter than the length header",
            payload.len()
        )));
    }

    let (header, compressed) = payload.split_at(LENGTH_HEADER_LEN);
    let expected = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

    // One byte past the header length is enough to tell "too long"
    let mut json = Vec::new();
    ZlibDecoder::new(compressed)
        .take(expected as u64 + 1)
        .read_to_end(&mut json)
        .map_err(|e| ProtocolError::CorruptPayload(format!("invalid zlib stream: {e}")))?;

    if json.len() != expected {
        return Err(ProtocolError::CorruptPayload(format!(
            "Invalid length: expected {expected}, got {}",
            json.len()
        )));
    }

    Ok(json)
}

/// Decode a link into a typed value
pub fn decode<T: DeserializeOwned>(uri: &str) -> Result<T> {
    let json = decode_json(uri)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        port: u16,
        tags: Vec<String>,
    }

    fn sample() -> Sample {
        Sample {
            name: "awg0".to_string(),
            port: 51820,
            tags: vec!["a".to_string(), "b".to_string()],
        }
    }

    fn tamper_header(uri: &str, delta: i64) -> String {
        let mut payload = URL_SAFE_NO_PAD
            .decode(uri.strip_prefix(LINK_SCHEME).unwrap())
            .unwrap();
        let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as i64;
        let tampered = ((len + delta) as u32).to_be_bytes();
        payload[..4].copy_from_slice(&tampered);
        format!("{LINK_SCHEME}{}", URL_SAFE_NO_PAD.encode(payload))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let uri = encode(&sample()).unwrap();
        assert!(uri.starts_with("vpn://"));
        assert!(!uri.contains('='));
        let body = uri.strip_prefix(LINK_SCHEME).unwrap();
        assert!(!body.contains('+') && !body.contains('/'));
        let decoded: Sample = decode(&uri).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_encoding_is_reproducible() {
        assert_eq!(encode(&sample()).unwrap(), encode(&sample()).unwrap());
    }

    #[test]
    fn test_canonical_json_uses_four_space_indent() {
        let json = to_canonical_json(&sample()).unwrap();
        assert!(json.starts_with("{\n    \"name\": \"awg0\",\n    \"port\": 51820,"));
    }

    #[test]
    fn test_length_header_matches_json_bytes() {
        let uri = encode(&sample()).unwrap();
        let payload = URL_SAFE_NO_PAD
            .decode(uri.strip_prefix(LINK_SCHEME).unwrap())
            .unwrap();
        let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        assert_eq!(len, to_canonical_json(&sample()).unwrap().len());
    }

    #[test]
    fn test_tampered_length_is_corrupt() {
        let uri = encode(&sample()).unwrap();
        for delta in [-1, 1, 1000] {
            let err = decode::<Sample>(&tamper_header(&uri, delta)).unwrap_err();
            assert!(matches!(err, ProtocolError::CorruptPayload(_)), "{err}");
        }
    }

    #[test]
    fn test_decode_accepts_missing_prefix_and_padding() {
        let uri = encode(&sample()).unwrap();
        let bare = uri.strip_prefix(LINK_SCHEME).unwrap();
        let padding = (4 - bare.len() % 4) % 4;
        let padded = format!("{bare}{}", "=".repeat(padding));
        assert_eq!(decode::<Sample>(bare).unwrap(), sample());
        assert_eq!(decode::<Sample>(&padded).unwrap(), sample());
    }

    #[test]
    fn test_oversized_stream_stops_at_header_length() {
        let uri = encode_json(&"x".repeat(1 << 20)).unwrap();
        let err = decode_json(&tamper_header(&uri, -((1 << 20) - 16))).unwrap_err();
        assert!(err.to_string().contains("expected 16, got 17"), "{err}");
    }

    #[test]
    fn test_garbage_is_corrupt() {
        for input in ["vpn://", "vpn://AAE", "vpn://not base64!", "vpn://AAAAEHh4eHh4"] {
            let err = decode_json(input).unwrap_err();
            assert!(matches!(err, ProtocolError::CorruptPayload(_)), "{input}: {err}");
        }
    }

    fn json_value() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[ -~]{0,24}".prop_map(serde_json::Value::from),
            "\\PC{0,8}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(serde_json::Value::from),
                prop::collection::btree_map("[a-z_]{1,12}", inner, 0..8)
                    .prop_map(|map| serde_json::Value::Object(map.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn json_round_trip(value in json_value()) {
            let uri = encode(&value).unwrap();
            let decoded: serde_json::Value = decode(&uri).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn tampered_header_rejected(value in json_value(), delta in any::<i32>()) {
            prop_assume!(delta != 0);
            let uri = encode(&value).unwrap();
            let tampered = tamper_header(&uri, i64::from(delta));
            let result = decode_json(&tampered);
            prop_assert!(matches!(result, Err(ProtocolError::CorruptPayload(_))));
        }
    }
}
