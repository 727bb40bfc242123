//! Length-prefixed codec for TCP framing
//!
//! All messages are framed as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: UTF-8 JSON body ]
//! ```
//!
//! This ensures message boundaries are preserved over TCP streams.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum message size (1 MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Invalid message length prefix: {0}")]
    InvalidLength(u32),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message body into a length-prefixed byte buffer
pub fn encode(body: &[u8]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    encode_into(body, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message body directly into a provided buffer
pub fn encode_into(body: &[u8], buf: &mut BytesMut) -> Result<(), CodecError> {
    if body.len() > MAX_MESSAGE_SIZE as usize {
        return Err(CodecError::MessageTooLarge(body.len()));
    }

    buf.reserve(4 + body.len());

    // Length prefix (big-endian u32), then the body
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);

    Ok(())
}

/// Encode a serializable value as a length-prefixed JSON frame
pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<Bytes, CodecError> {
    encode(&serde_json::to_vec(value)?)
}

/// Try to decode one length-prefixed frame from a buffer
///
/// Returns:
/// - `Ok(Some(bytes))` if a complete frame was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the data is invalid
pub fn decode(buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
    // Need at least 4 bytes for the length prefix
    if buf.len() < 4 {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);

    if msg_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::InvalidLength(msg_len));
    }

    let total_len = 4 + msg_len as usize;

    // Check if we have the complete frame
    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(4);
    let body = buf.split_to(msg_len as usize);

    Ok(Some(body.freeze()))
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Bytes>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Decode the next frame and parse it as JSON
    pub fn decode_next_json(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        match self.decode_next()? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Encoder for building frames
#[derive(Debug, Default)]
pub struct FrameEncoder {
    /// Output buffer
    buffer: BytesMut,
}

impl FrameEncoder {
    /// Create a new frame encoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Encode a message body and add to the output buffer
    pub fn encode(&mut self, body: &[u8]) -> Result<(), CodecError> {
        encode_into(body, &mut self.buffer)
    }

    /// Take the encoded bytes, leaving an empty buffer
    pub fn take(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Check if the encoder has any pending data
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_body() -> Vec<u8> {
        serde_json::to_vec(&json!({"fcn": "heart_beat", "id": "app001", "tick": 7})).unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let body = create_test_body();

        let encoded = encode(&body).expect("encode failed");

        // Verify length prefix
        let len_prefix = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len_prefix as usize, encoded.len() - 4);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = decode(&mut buf).expect("decode failed").expect("no frame");

        assert_eq!(&decoded[..], &body[..]);
        assert!(buf.is_empty(), "buffer should be empty after decode");
    }

    #[test]
    fn test_partial_decode() {
        let encoded = encode(&create_test_body()).expect("encode failed");

        // Try decoding with only partial data
        let mut buf = BytesMut::from(&encoded[..5]);
        let result = decode(&mut buf).expect("decode should not fail on partial data");
        assert!(result.is_none(), "should return None for partial data");

        // Buffer should be unchanged (data not consumed)
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_frame_decoder() {
        let body = create_test_body();
        let encoded = encode(&body).expect("encode failed");

        let mut decoder = FrameDecoder::new();

        // Feed data in chunks
        decoder.extend(&encoded[..5]);
        assert!(decoder.decode_next().expect("decode error").is_none());

        decoder.extend(&encoded[5..]);
        let decoded = decoder
            .decode_next()
            .expect("decode error")
            .expect("should have frame");

        assert_eq!(&decoded[..], &body[..]);
    }

    #[test]
    fn test_multiple_frames() {
        let encoded1 = encode_json(&json!({"fcn": "who_controls", "id": "app001"})).unwrap();
        let encoded2 = encode_json(&json!({"fcn": "get_owner", "id": "app001"})).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&encoded1);
        decoder.extend(&encoded2);

        let first = decoder.decode_next_json().expect("decode error").unwrap();
        let second = decoder.decode_next_json().expect("decode error").unwrap();
        assert_eq!(first["fcn"], "who_controls");
        assert_eq!(second["fcn"], "get_owner");
        assert!(decoder.decode_next().expect("decode error").is_none());
    }

    #[test]
    fn test_message_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE + 1); // Length prefix exceeds max
        buf.put_bytes(0, 100);

        let result = decode(&mut buf);
        assert!(matches!(result, Err(CodecError::InvalidLength(_))));
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let body = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        assert!(matches!(encode(&body), Err(CodecError::MessageTooLarge(_))));
    }
}
