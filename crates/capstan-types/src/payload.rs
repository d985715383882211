use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key naming the concrete encoding of a payload.
pub const ENCODING_KEY: &str = "encoding";

/// JSON-serialized value.
pub const ENCODING_JSON: &str = "json/plain";
/// Absent value (unit, `None`).
pub const ENCODING_BINARY_NULL: &str = "binary/null";
/// Raw bytes passed through untouched.
pub const ENCODING_BINARY_PLAIN: &str = "binary/plain";
/// Protobuf message rendered as JSON.
pub const ENCODING_JSON_PROTOBUF: &str = "json/protobuf";

/// Opaque value crossing the bridge boundary.
///
/// The `metadata` map carries at least the `encoding` key; converters select
/// a decoder by that value. Metadata uses a `BTreeMap` so serialized
/// payloads have a stable field order.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub metadata: BTreeMap<String, Vec<u8>>,
    pub data: Vec<u8>,
}

impl Payload {
    /// Payload with a single `encoding` metadata entry.
    pub fn new(encoding: &str, data: Vec<u8>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(ENCODING_KEY.to_string(), encoding.as_bytes().to_vec());
        Self { metadata, data }
    }

    /// The declared encoding, if present and valid UTF-8.
    pub fn encoding(&self) -> Option<&str> {
        self.metadata
            .get(ENCODING_KEY)
            .and_then(|raw| std::str::from_utf8(raw).ok())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoding = self.encoding().unwrap_or("?");
        match std::str::from_utf8(&self.data) {
            Ok(text) if text.len() <= 64 => {
                write!(f, "Payload({encoding}, {text:?})")
            }
            _ => write!(f, "Payload({encoding}, {} bytes)", self.data.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_read_from_metadata() {
        let p = Payload::new(ENCODING_JSON, b"\"x\"".to_vec());
        assert_eq!(p.encoding(), Some(ENCODING_JSON));
    }

    #[test]
    fn missing_or_invalid_encoding_is_none() {
        let mut p = Payload::default();
        assert_eq!(p.encoding(), None);
        p.metadata
            .insert(ENCODING_KEY.to_string(), vec![0xff, 0xfe]);
        assert_eq!(p.encoding(), None);
    }

    #[test]
    fn serde_round_trip_preserves_metadata_order() {
        let mut p = Payload::new(ENCODING_JSON, b"1".to_vec());
        p.metadata.insert("b".into(), vec![2]);
        p.metadata.insert("a".into(), vec![1]);
        let json = serde_json::to_string(&p).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        similar_asserts::assert_eq!(p, back);
    }
}
