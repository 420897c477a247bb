//! Record identities and the pluggable record serializer.
//!
//! The wire protocol never interprets record payloads: it moves opaque byte
//! arrays whose encoding is negotiated at connect time by serializer name.
//! The default serializer is `msgpack-v1`, MessagePack with named fields over
//! JSON-shaped documents.

use std::fmt;

use serde_json::Value;

use crate::error::DriverError;

/// Identity of a record: bucket id plus position within the bucket.
///
/// Client-provisional identities use a negative bucket id; the server
/// replaces them with real identities at transaction begin/commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub bucket: i32,
    pub position: i64,
}

impl RecordId {
    pub const NULL: RecordId = RecordId {
        bucket: -1,
        position: -1,
    };

    pub fn new(bucket: i32, position: i64) -> Self {
        Self { bucket, position }
    }

    /// True for identities assigned client-side, before the server has
    /// acknowledged the record.
    pub fn is_provisional(&self) -> bool {
        self.bucket < -1
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.bucket, self.position)
    }
}

/// A decoded record as handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub version: i32,
    pub kind: u8,
    pub body: Value,
}

/// Capability for encoding and decoding record payloads.
///
/// The name is exchanged during the open/connect handshake so both sides
/// agree on the payload encoding.
pub trait RecordSerializer: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, body: &Value) -> Result<Vec<u8>, DriverError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, DriverError>;
}

/// Default serializer: MessagePack with named fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackSerializer;

impl RecordSerializer for MsgpackSerializer {
    fn name(&self) -> &str {
        "msgpack-v1"
    }

    fn encode(&self, body: &Value) -> Result<Vec<u8>, DriverError> {
        rmp_serde::to_vec_named(body)
            .map_err(|e| DriverError::Protocol(format!("record serialization failed: {e}")))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, DriverError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| DriverError::Protocol(format!("record deserialization failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_display() {
        assert_eq!(RecordId::new(12, 7).to_string(), "#12:7");
        assert_eq!(RecordId::NULL.to_string(), "#-1:-1");
    }

    #[test]
    fn test_provisional_ids() {
        assert!(RecordId::new(-2, 4).is_provisional());
        assert!(!RecordId::new(3, 4).is_provisional());
        assert!(!RecordId::NULL.is_provisional());
        assert!(RecordId::NULL.is_null());
    }

    #[test]
    fn test_msgpack_round_trip() {
        let serializer = MsgpackSerializer;
        let body = json!({"name": "Alice", "age": 30, "tags": ["a", "b"]});
        let bytes = serializer.encode(&body).unwrap();
        let decoded = serializer.decode(&bytes).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let serializer = MsgpackSerializer;
        assert!(serializer.decode(&[0xc1, 0xff, 0x00]).is_err());
    }
}
