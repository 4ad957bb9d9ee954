use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

use rmpv::{Integer, Value};

pub const DEFAULT_MAX_ENVELOPE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

pub type MessageEnvelope = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: DEFAULT_MAX_ENVELOPE_SIZE_BYTES,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    InvalidConfig { max_envelope_size_bytes: usize },
    PayloadTooLarge { size: usize, limit: usize },
    FrameTooShort { size: usize },
    FrameLengthMismatch { declared: usize, actual_payload: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    EnvelopeMustBeMap,
    MapKeyMustBeUtf8String,
    FloatNotAllowed,
    ExtensionTypeNotAllowed,
    IntegerOutOfRange,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig {
                max_envelope_size_bytes,
            } => write!(
                f,
                "wire.max_envelope_size_bytes must be between 1 and {}, got {max_envelope_size_bytes}",
                u32::MAX
            ),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::FrameTooShort { size } => {
                write!(f, "frame size {size} is smaller than 4-byte header")
            }
            Self::FrameLengthMismatch {
                declared,
                actual_payload,
            } => write!(
                f,
                "frame length mismatch: declared {declared} bytes, actual payload {actual_payload} bytes"
            ),
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: frame length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: frame length {length} exceeds max {limit}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::EnvelopeMustBeMap => write!(f, "message envelope must be a map"),
            Self::MapKeyMustBeUtf8String => write!(f, "map keys must be UTF-8 strings"),
            Self::FloatNotAllowed => write!(f, "floats are not allowed in message envelope"),
            Self::ExtensionTypeNotAllowed => {
                write!(f, "MessagePack extension values are not allowed")
            }
            Self::IntegerOutOfRange => write!(f, "integer value must fit in signed int64"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Length-prefixed MessagePack framing shared by controller and agent.
#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    config: CodecConfig,
}

impl WireCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn from_app_config(app_config: &crate::config::AppConfig) -> Result<Self, CodecError> {
        let max = app_config.wire.max_envelope_size_bytes;
        if max == 0 || max > u32::MAX as usize {
            return Err(CodecError::InvalidConfig {
                max_envelope_size_bytes: max,
            });
        }

        Ok(Self::new(CodecConfig {
            max_envelope_size_bytes: max,
        }))
    }

    pub fn max_envelope_size_bytes(&self) -> usize {
        self.config.max_envelope_size_bytes
    }

    pub fn encode_frame(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let payload = self.encode_payload(envelope)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode_frame(&self, frame: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if frame.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(CodecError::FrameTooShort { size: frame.len() });
        }

        let declared_len = self.declared_length(frame)?;
        let payload = &frame[FRAME_HEADER_SIZE_BYTES..];
        if payload.len() != declared_len {
            return Err(CodecError::FrameLengthMismatch {
                declared: declared_len,
                actual_payload: payload.len(),
            });
        }

        self.decode_payload(payload)
    }

    fn declared_length(&self, frame: &[u8]) -> Result<usize, CodecError> {
        let declared_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if declared_len == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if declared_len > self.config.max_envelope_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length: declared_len,
                limit: self.config.max_envelope_size_bytes,
            });
        }
        Ok(declared_len)
    }

    fn encode_payload(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, CodecError> {
        let mut map_pairs = Vec::with_capacity(envelope.len());
        for (key, value) in envelope {
            validate_value(value)?;
            map_pairs.push((Value::String(key.as_str().into()), value.clone()));
        }

        let mut encoded = Vec::new();
        rmpv::encode::write_value(&mut encoded, &Value::Map(map_pairs))
            .map_err(CodecError::MessagePackEncode)?;

        if encoded.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if encoded.len() > self.config.max_envelope_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: encoded.len(),
                limit: self.config.max_envelope_size_bytes,
            });
        }

        Ok(encoded)
    }

    fn decode_payload(&self, payload: &[u8]) -> Result<MessageEnvelope, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }

        let mut cursor = Cursor::new(payload);
        let value =
            rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
        if cursor.position() as usize != payload.len() {
            return Err(CodecError::TrailingDataInPayload);
        }

        parse_envelope(value)
    }
}

/// Reassembles complete frames out of a non-blocking byte stream.
///
/// Reads may deliver several frames at once or stop in the middle of one;
/// bytes belonging to an incomplete frame stay buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }

    /// Pops the next complete frame (header included). A malformed length
    /// header is reported immediately so the connection can be dropped
    /// without waiting for bytes that will never be valid.
    pub fn next_frame(&mut self, codec: &WireCodec) -> Result<Option<Vec<u8>>, CodecError> {
        if self.pending.len() < FRAME_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        let declared_len = codec.declared_length(&self.pending)?;
        let total = FRAME_HEADER_SIZE_BYTES + declared_len;
        if self.pending.len() < total {
            return Ok(None);
        }

        let rest = self.pending.split_off(total);
        let frame = std::mem::replace(&mut self.pending, rest);
        Ok(Some(frame))
    }
}

fn parse_envelope(value: Value) -> Result<MessageEnvelope, CodecError> {
    let Value::Map(entries) = value else {
        return Err(CodecError::EnvelopeMustBeMap);
    };

    let mut envelope = MessageEnvelope::new();
    for (key, value) in entries {
        let key = parse_key(&key)?;
        validate_value(&value)?;
        envelope.insert(key, value);
    }

    Ok(envelope)
}

fn parse_key(key: &Value) -> Result<String, CodecError> {
    key.as_str()
        .map(str::to_owned)
        .ok_or(CodecError::MapKeyMustBeUtf8String)
}

fn validate_value(value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Nil | Value::Boolean(_) | Value::String(_) | Value::Binary(_) => Ok(()),
        Value::Integer(number) => validate_integer(number),
        Value::Array(values) => values.iter().try_for_each(validate_value),
        Value::Map(entries) => {
            for (key, value) in entries {
                parse_key(key)?;
                validate_value(value)?;
            }
            Ok(())
        }
        Value::F32(_) | Value::F64(_) => Err(CodecError::FloatNotAllowed),
        Value::Ext(_, _) => Err(CodecError::ExtensionTypeNotAllowed),
    }
}

fn validate_integer(number: &Integer) -> Result<(), CodecError> {
    if number.as_i64().is_some() {
        return Ok(());
    }

    match number.as_u64() {
        Some(value) if value <= i64::MAX as u64 => Ok(()),
        _ => Err(CodecError::IntegerOutOfRange),
    }
}

/// Converts a JSON value into its wire representation. Floats are carried
/// as strings since the envelope forbids MessagePack floats.
pub fn json_value_to_rmpv(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(flag) => Value::Boolean(*flag),
        serde_json::Value::Number(number) => match number.as_i64() {
            Some(integer) => Value::Integer(integer.into()),
            None => Value::String(number.to_string().into()),
        },
        serde_json::Value::String(text) => Value::String(text.as_str().into()),
        serde_json::Value::Array(values) => {
            Value::Array(values.iter().map(json_value_to_rmpv).collect())
        }
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(key, value)| (Value::String(key.as_str().into()), json_value_to_rmpv(value)))
                .collect(),
        ),
    }
}

pub fn rmpv_value_to_json(value: &Value) -> Result<serde_json::Value, &'static str> {
    match value {
        Value::Nil => Ok(serde_json::Value::Null),
        Value::Boolean(flag) => Ok(serde_json::Value::Bool(*flag)),
        Value::Integer(number) => number
            .as_i64()
            .map(|raw| serde_json::json!(raw))
            .ok_or("contains unsupported integer representation"),
        Value::String(text) => text
            .as_str()
            .map(|raw| serde_json::json!(raw))
            .ok_or("contains non UTF-8 string"),
        Value::Binary(bytes) => Ok(serde_json::json!(bytes)),
        Value::Array(values) => values
            .iter()
            .map(rmpv_value_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array),
        Value::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (key, value) in entries {
                let Some(text_key) = key.as_str() else {
                    return Err("contains non-string map key");
                };
                map.insert(text_key.to_owned(), rmpv_value_to_json(value)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        _ => Err("contains unsupported value type"),
    }
}
