//! Second decoding stage: frame bodies to typed envelopes and back.

use super::compress::{Compressor, GzipCompressor, NoCompression};
use super::framing::{Frame, Header, MAX_FRAME_SIZE, MessageKind};
use super::message::{Body, Envelope};
use super::serialize::{CborSerializer, JsonSerializer, Serializer};
use crate::error::{CodecError, Error, Result};

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Serializers and compressors known to this runtime, keyed by wire code.
///
/// Unknown codes resolve to the configured defaults and log a warning rather
/// than failing the message.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    serializers: HashMap<u8, Arc<dyn Serializer>>,
    compressors: HashMap<u8, Arc<dyn Compressor>>,
    default_serializer: Arc<dyn Serializer>,
    default_compressor: Arc<dyn Compressor>,
    max_body_size: usize,
}

impl CodecRegistry {
    /// Registry with the built-in codecs, defaulting to JSON without compression.
    #[must_use]
    pub fn new() -> Self {
        let json: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        let none: Arc<dyn Compressor> = Arc::new(NoCompression);

        Self {
            serializers: HashMap::new(),
            compressors: HashMap::new(),
            default_serializer: Arc::clone(&json),
            default_compressor: Arc::clone(&none),
            max_body_size: MAX_FRAME_SIZE,
        }
        .with_serializer(json)
        .with_serializer(Arc::new(CborSerializer))
        .with_compressor(none)
        .with_compressor(Arc::new(GzipCompressor))
    }

    /// Registry with the built-in codecs and defaults chosen by name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if either name is not registered.
    pub fn with_defaults(serializer: &str, compressor: &str) -> Result<Self> {
        let mut registry = Self::new();

        registry.default_serializer = registry
            .serializers
            .values()
            .find(|s| s.name() == serializer)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("unknown serializer `{serializer}`")))?;

        registry.default_compressor = registry
            .compressors
            .values()
            .find(|c| c.name() == compressor)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("unknown compressor `{compressor}`")))?;

        Ok(registry)
    }

    /// Register an additional serializer, replacing any with the same code.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers.insert(serializer.code(), serializer);
        self
    }

    /// Register an additional compressor, replacing any with the same code.
    #[must_use]
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressors.insert(compressor.code(), compressor);
        self
    }

    /// Limit bodies to `size` bytes after decompression.
    #[must_use]
    pub const fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Largest body accepted after decompression.
    #[must_use]
    pub const fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Code of the default serializer.
    #[must_use]
    pub fn default_serializer(&self) -> u8 {
        self.default_serializer.code()
    }

    /// Code of the default compressor.
    #[must_use]
    pub fn default_compressor(&self) -> u8 {
        self.default_compressor.code()
    }

    /// Serializer for `code`, or the default when the code is unknown.
    #[must_use]
    pub fn serializer(&self, code: u8) -> &Arc<dyn Serializer> {
        self.serializers.get(&code).unwrap_or_else(|| {
            warn!(
                "unknown serializer code {}, falling back to {}",
                code,
                self.default_serializer.name()
            );
            &self.default_serializer
        })
    }

    /// Compressor for `code`, or the default when the code is unknown.
    #[must_use]
    pub fn compressor(&self, code: u8) -> &Arc<dyn Compressor> {
        self.compressors.get(&code).unwrap_or_else(|| {
            warn!(
                "unknown compressor code {}, falling back to {}",
                code,
                self.default_compressor.name()
            );
            &self.default_compressor
        })
    }

    /// Encode an envelope into a frame.
    ///
    /// The frame header names the codecs actually used, which differ from the
    /// envelope's when it asked for an unknown code.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not match the message kind or cannot
    /// be serialized or compressed.
    pub fn encode(&self, envelope: &Envelope) -> std::result::Result<Frame, CodecError> {
        let serializer = self.serializer(envelope.header.serializer);
        let compressor = self.compressor(envelope.header.compressor);

        let header = Header {
            serializer: serializer.code(),
            compressor: compressor.code(),
            ..envelope.header
        };

        let body = match (header.kind, &envelope.body) {
            (MessageKind::Heartbeat, _) => Bytes::new(),
            (MessageKind::Request, Body::Request(payload)) => {
                encode_body(payload, serializer.as_ref(), compressor.as_ref())?
            }
            (MessageKind::Response, Body::Response(response)) => {
                encode_body(response, serializer.as_ref(), compressor.as_ref())?
            }
            (kind, body) => {
                return Err(CodecError::UnexpectedBody(format!(
                    "{kind:?} message cannot carry {body:?}"
                )));
            }
        };

        Ok(Frame::new(header, body))
    }

    /// Decode a frame into an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be decompressed or deserialized.
    /// The frame header is still valid in that case, so callers can fail the
    /// matching pending call.
    pub fn decode(&self, frame: &Frame) -> std::result::Result<Envelope, CodecError> {
        let body = match frame.header.kind {
            MessageKind::Heartbeat => Body::Empty,
            MessageKind::Request => Body::Request(self.decode_body(frame)?),
            MessageKind::Response => Body::Response(self.decode_body(frame)?),
        };

        Ok(Envelope {
            header: frame.header,
            body,
        })
    }

    fn decode_body<T: DeserializeOwned>(&self, frame: &Frame) -> std::result::Result<T, CodecError> {
        let serializer = self.serializer(frame.header.serializer);
        let compressor = self.compressor(frame.header.compressor);

        let raw = compressor.decompress(&frame.body, self.max_body_size)?;
        let value = serializer.deserialize(&raw)?;
        serde_json::from_value(value).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_body<T: Serialize>(
    body: &T,
    serializer: &dyn Serializer,
    compressor: &dyn Compressor,
) -> std::result::Result<Bytes, CodecError> {
    let value =
        serde_json::to_value(body).map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
    let raw = serializer.serialize(&value)?;
    Ok(Bytes::from(compressor.compress(&raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::compress::{GZIP, NONE};
    use crate::protocol::message::{RequestPayload, ResponseBody, Status};
    use crate::protocol::serialize::{CBOR, JSON};
    use serde_json::json;
    use tracing_test::traced_test;

    fn say_hi() -> RequestPayload {
        RequestPayload {
            interface_name: "HelloService".to_string(),
            method_name: "sayHi".to_string(),
            parameter_types: vec!["alloc::string::String".to_string()],
            parameter_values: vec![json!("hi")],
            return_type: "alloc::string::String".to_string(),
        }
    }

    #[test]
    fn test_roundtrip_under_every_codec_pair() {
        let registry = CodecRegistry::new();

        for serializer in [JSON, CBOR] {
            for compressor in [NONE, GZIP] {
                let request = Envelope::request(1, serializer, compressor, say_hi());
                let frame = registry.encode(&request).unwrap();
                assert_eq!(frame.header.serializer, serializer);
                assert_eq!(frame.header.compressor, compressor);
                assert_eq!(registry.decode(&frame).unwrap(), request);

                let response = Envelope::response(
                    1,
                    serializer,
                    compressor,
                    ResponseBody::success(json!({"greeting": "hello", "n": 3, "f": 1.5})),
                );
                let frame = registry.encode(&response).unwrap();
                assert_eq!(registry.decode(&frame).unwrap(), response);
            }
        }
    }

    #[test]
    fn test_heartbeat_encodes_empty_body() {
        let registry = CodecRegistry::new();
        let frame = registry.encode(&Envelope::heartbeat(9, JSON, GZIP)).unwrap();

        assert!(frame.body.is_empty());
        assert_eq!(registry.decode(&frame).unwrap().body, Body::Empty);
    }

    #[test]
    #[traced_test]
    fn test_unknown_codes_fall_back_to_defaults() {
        let registry = CodecRegistry::with_defaults("cbor", "gzip").unwrap();

        let request = Envelope::request(3, 77, 88, say_hi());
        let frame = registry.encode(&request).unwrap();
        assert_eq!(frame.header.serializer, CBOR);
        assert_eq!(frame.header.compressor, GZIP);
        assert!(logs_contain("unknown serializer code 77"));

        let decoded = registry.decode(&frame).unwrap();
        assert_eq!(decoded.body, request.body);
    }

    #[test]
    fn test_unknown_default_name_is_rejected() {
        assert!(CodecRegistry::with_defaults("hessian", "none").is_err());
        assert!(CodecRegistry::with_defaults("json", "zstd").is_err());
    }

    #[test]
    fn test_corrupt_body_is_a_codec_error() {
        let registry = CodecRegistry::new();
        let mut frame = registry
            .encode(&Envelope::response(
                5,
                JSON,
                GZIP,
                ResponseBody::status(Status::RateLimited),
            ))
            .unwrap();
        frame.body = Bytes::from_static(b"garbage");

        let err = registry.decode(&frame).unwrap_err();
        assert!(matches!(err, CodecError::DecompressionFailed(_)));
        assert_eq!(frame.header.request_id, 5);
    }

    #[test]
    fn test_inflated_body_beyond_limit_is_refused() {
        let sender = CodecRegistry::new();
        let mut payload = say_hi();
        payload.parameter_values = vec![json!("a".repeat(64 << 10))];
        let frame = sender
            .encode(&Envelope::request(11, JSON, GZIP, payload))
            .unwrap();
        assert!(frame.body.len() < 4 << 10);

        let receiver = CodecRegistry::new().with_max_body_size(16 << 10);
        let err = receiver.decode(&frame).unwrap_err();
        assert!(matches!(err, CodecError::DecompressionFailed(_)));

        assert!(sender.decode(&frame).is_ok());
    }

    #[test]
    fn test_mismatched_body_is_rejected() {
        let registry = CodecRegistry::new();
        let mut envelope = Envelope::request(1, JSON, NONE, say_hi());
        envelope.body = Body::Response(ResponseBody::heartbeat());

        assert!(matches!(
            registry.encode(&envelope),
            Err(CodecError::UnexpectedBody(_))
        ));
    }
}
