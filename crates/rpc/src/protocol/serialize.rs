//! Body serializers, selected on the wire by a single-byte code.

use crate::error::CodecError;

use std::fmt::Debug;

use serde_json::Value;

/// Code of the JSON serializer.
pub const JSON: u8 = 1;

/// Code of the CBOR serializer.
pub const CBOR: u8 = 2;

/// Converts self-describing values to bytes and back.
///
/// Typed bodies are mapped onto [`Value`] first so implementations stay object safe.
pub trait Serializer: Debug + Send + Sync + 'static {
    /// Wire code of this serializer.
    fn code(&self) -> u8;

    /// Configuration name of this serializer.
    fn name(&self) -> &'static str;

    /// Encode a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Decode a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// JSON via `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn code(&self) -> u8 {
        JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::SerializationFailed(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}

/// CBOR via `ciborium`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborSerializer;

impl Serializer for CborSerializer {
    fn code(&self) -> u8 {
        CBOR
    }

    fn name(&self) -> &'static str {
        "cbor"
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let mut vec = Vec::new();
        ciborium::ser::into_writer(value, &mut vec)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
        Ok(vec)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode() {
        let value = json!({"id": 42, "name": "test", "data": [1, 2, 3, 4, 5], "ok": true});

        for serializer in [&JsonSerializer as &dyn Serializer, &CborSerializer] {
            let encoded = serializer.serialize(&value).unwrap();
            let decoded = serializer.deserialize(&encoded).unwrap();
            assert_eq!(decoded, value, "{}", serializer.name());
        }
    }

    #[test]
    fn test_decode_error() {
        let bad_data = [0xFF, 0xFF, 0xFF];
        assert!(JsonSerializer.deserialize(&bad_data).is_err());
        assert!(CborSerializer.deserialize(&bad_data).is_err());
    }
}
