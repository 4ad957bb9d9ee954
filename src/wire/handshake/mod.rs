use std::fmt;

use crate::wire::codec::{CodecError, WireCodec};
use crate::wire::envelope::{EnvelopeError, PayloadMap, WireEnvelope};

pub const HELLO_MESSAGE_TYPE: i64 = 1;
pub const HI_MESSAGE_TYPE: i64 = 103;

#[derive(Debug)]
pub enum HandshakeError {
    Codec(CodecError),
    Envelope(EnvelopeError),
    UnexpectedReply { message_type: i64 },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "handshake codec error: {source}"),
            Self::Envelope(source) => write!(f, "handshake envelope error: {source}"),
            Self::UnexpectedReply { message_type } => {
                write!(f, "expected HI in reply to HELLO, got message type {message_type}")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Answers a HELLO with the matching HI frame, echoing its request id.
pub fn build_hi_frame(codec: &WireCodec, hello_request_id: &str) -> Result<Vec<u8>, HandshakeError> {
    let response = WireEnvelope::new(HI_MESSAGE_TYPE, hello_request_id, PayloadMap::new());
    codec
        .encode_frame(&response.into_raw())
        .map_err(HandshakeError::Codec)
}

pub fn build_hello_frame(codec: &WireCodec, request_id: &str) -> Result<Vec<u8>, HandshakeError> {
    codec
        .encode_frame(&WireEnvelope::new(HELLO_MESSAGE_TYPE, request_id, PayloadMap::new()).into_raw())
        .map_err(HandshakeError::Codec)
}

/// Client side check that the controller answered HELLO with HI.
pub fn expect_hi(codec: &WireCodec, frame: &[u8]) -> Result<WireEnvelope, HandshakeError> {
    let raw = codec.decode_frame(frame).map_err(HandshakeError::Codec)?;
    let envelope = WireEnvelope::from_raw(&raw).map_err(HandshakeError::Envelope)?;
    if envelope.message_type != HI_MESSAGE_TYPE {
        return Err(HandshakeError::UnexpectedReply {
            message_type: envelope.message_type,
        });
    }
    Ok(envelope)
}
