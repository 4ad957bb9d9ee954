use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

use crate::wire::codec::MessageEnvelope;

pub const PROTOCOL_VERSION: i64 = 1;
/// Request id used by frames that expect no reply (heartbeats, pushed signals).
pub const SIGNAL_REQUEST_ID: &str = "0";
pub const OK_MESSAGE_TYPE: i64 = 101;
pub const ERR_MESSAGE_TYPE: i64 = 102;

pub type PayloadMap = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct WireEnvelope {
    pub version: i64,
    pub message_type: i64,
    pub request_id: String,
    pub payload: PayloadMap,
}

#[derive(Debug, PartialEq)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
    InvalidProtocolVersion { expected: i64, actual: i64 },
    IntegerOutOfRange { field: &'static str },
    PayloadMapKeyMustBeUtf8String,
    RequestIdRequired,
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
            Self::InvalidProtocolVersion { expected, actual } => {
                write!(f, "invalid protocol version {actual}, expected {expected}")
            }
            Self::IntegerOutOfRange { field } => {
                write!(f, "integer field '{field}' must fit signed int64")
            }
            Self::PayloadMapKeyMustBeUtf8String => {
                write!(f, "payload map keys must be UTF-8 strings")
            }
            Self::RequestIdRequired => write!(f, "request id must be non-empty"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl WireEnvelope {
    pub fn new(message_type: i64, request_id: impl Into<String>, payload: PayloadMap) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn signal(message_type: i64, payload: PayloadMap) -> Self {
        Self::new(message_type, SIGNAL_REQUEST_ID, payload)
    }

    pub fn ok(request_id: impl Into<String>, payload: Option<PayloadMap>) -> Self {
        Self::new(OK_MESSAGE_TYPE, request_id, payload.unwrap_or_default())
    }

    pub fn err(
        request_id: impl Into<String>,
        code: &str,
        message: Option<String>,
        details: Option<Value>,
    ) -> Self {
        let mut payload = PayloadMap::new();
        payload.insert("code".to_owned(), Value::String(code.into()));
        if let Some(message) = message {
            payload.insert("message".to_owned(), Value::String(message.into()));
        }
        if let Some(details) = details {
            payload.insert("details".to_owned(), details);
        }
        Self::new(ERR_MESSAGE_TYPE, request_id, payload)
    }

    pub fn is_signal(&self) -> bool {
        self.request_id == SIGNAL_REQUEST_ID
    }

    pub fn from_raw(raw: &MessageEnvelope) -> Result<Self, EnvelopeError> {
        let version = parse_i64(raw.get("v"), "v")?;
        if version != PROTOCOL_VERSION {
            return Err(EnvelopeError::InvalidProtocolVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let envelope = Self {
            version,
            message_type: parse_i64(raw.get("t"), "t")?,
            request_id: parse_string(raw.get("rid"), "rid")?,
            payload: parse_payload_map(raw.get("p"))?,
        };
        if envelope.request_id.is_empty() {
            return Err(EnvelopeError::RequestIdRequired);
        }

        Ok(envelope)
    }

    pub fn into_raw(self) -> MessageEnvelope {
        let mut raw = MessageEnvelope::new();
        raw.insert("v".to_owned(), Value::Integer(self.version.into()));
        raw.insert("t".to_owned(), Value::Integer(self.message_type.into()));
        raw.insert("rid".to_owned(), Value::String(self.request_id.into()));
        raw.insert(
            "p".to_owned(),
            Value::Map(
                self.payload
                    .into_iter()
                    .map(|(k, v)| (Value::String(k.into()), v))
                    .collect(),
            ),
        );
        raw
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

fn parse_i64(value: Option<&Value>, field: &'static str) -> Result<i64, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    let Value::Integer(integer) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field,
            expected: "int",
        });
    };

    if let Some(v) = integer.as_i64() {
        return Ok(v);
    }

    match integer.as_u64() {
        Some(v) if v <= i64::MAX as u64 => Ok(v as i64),
        _ => Err(EnvelopeError::IntegerOutOfRange { field }),
    }
}

fn parse_string(value: Option<&Value>, field: &'static str) -> Result<String, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field })?;
    value
        .as_str()
        .map(str::to_owned)
        .ok_or(EnvelopeError::InvalidFieldType {
            field,
            expected: "string",
        })
}

fn parse_payload_map(value: Option<&Value>) -> Result<PayloadMap, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingField { field: "p" })?;
    let Value::Map(entries) = value else {
        return Err(EnvelopeError::InvalidFieldType {
            field: "p",
            expected: "map",
        });
    };

    let mut payload = PayloadMap::new();
    for (key, value) in entries {
        let Some(text) = key.as_str() else {
            return Err(EnvelopeError::PayloadMapKeyMustBeUtf8String);
        };
        payload.insert(text.to_owned(), value.clone());
    }

    Ok(payload)
}
