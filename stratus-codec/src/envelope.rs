//! Payload codec for RPC requests and responses.

use stratus_core::{CodecError, Request, Response};

use crate::aligned::AlignedBufferPool;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Encodes [`Request`]/[`Response`] messages to broker payloads and back.
///
/// The broker preserves message boundaries, so payloads carry no length
/// prefix. Decoding validates the archive before deserializing, so a
/// malformed payload is an error, never undefined behavior.
///
/// ## Example
///
/// ```rust
/// use stratus_codec::EnvelopeCodec;
/// use stratus_core::{Request, Uuid, WireValue};
///
/// let codec = EnvelopeCodec::new();
/// let request = Request::new(Uuid::new_v4(), "add", vec![WireValue::Int(3), WireValue::Int(42)]);
///
/// let payload = codec.encode_request(&request).unwrap();
/// assert_eq!(codec.decode_request(&payload).unwrap(), request);
/// ```
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_payload_size: usize,
    buffers: AlignedBufferPool,
}

impl EnvelopeCodec {
    /// Create a codec with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_payload_size(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a codec with a custom maximum payload size.
    #[must_use]
    pub fn with_max_payload_size(max_payload_size: usize) -> Self {
        Self {
            max_payload_size,
            buffers: AlignedBufferPool::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn encode_request(&self, request: &Request) -> Result<Vec<u8>, CodecError> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        self.check_size(bytes.len())?;
        Ok(bytes.to_vec())
    }

    pub fn decode_request(&self, payload: &[u8]) -> Result<Request, CodecError> {
        self.check_size(payload.len())?;
        let mut buf = self.buffers.acquire();
        rkyv::from_bytes::<Request, rkyv::rancor::Error>(buf.fill(payload))
            .map_err(|e| CodecError::Deserialization(e.to_string()))
    }

    pub fn encode_response(&self, response: &Response) -> Result<Vec<u8>, CodecError> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        self.check_size(bytes.len())?;
        Ok(bytes.to_vec())
    }

    pub fn decode_response(&self, payload: &[u8]) -> Result<Response, CodecError> {
        self.check_size(payload.len())?;
        let mut buf = self.buffers.acquire();
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(buf.fill(payload))
            .map_err(|e| CodecError::Deserialization(e.to_string()))
    }

    #[inline]
    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_payload_size {
            return Err(CodecError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            });
        }
        Ok(())
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}
