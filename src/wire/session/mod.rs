pub mod runtime;

use std::fmt;

use rmpv::Value;

use crate::orchestrator::dispatch::{DispatchError, OperationDescriptor, CALL_MESSAGE_TYPE};
use crate::orchestrator::jobs::{Job, JobId};
use crate::orchestrator::nodes::StatusChange;
use crate::wire::codec::{json_value_to_rmpv, rmpv_value_to_json, CodecError, WireCodec};
use crate::wire::envelope::{
    EnvelopeError, PayloadMap, WireEnvelope, ERR_MESSAGE_TYPE, OK_MESSAGE_TYPE,
};
use crate::wire::handshake::HELLO_MESSAGE_TYPE;

pub const REGISTER_MESSAGE_TYPE: i64 = 2;
pub const ATTACH_MESSAGE_TYPE: i64 = 3;
pub const PING_MESSAGE_TYPE: i64 = 4;
pub const LSNODE_MESSAGE_TYPE: i64 = 5;
pub const NODE_MESSAGE_TYPE: i64 = 6;
pub const UNIT_MESSAGE_TYPE: i64 = 7;
pub const JOB_MESSAGE_TYPE: i64 = 8;
pub const CANCEL_MESSAGE_TYPE: i64 = 9;
pub const SUBSCRIBE_MESSAGE_TYPE: i64 = 10;
pub const UNSUBSCRIBE_MESSAGE_TYPE: i64 = 11;
pub const STATUS_MESSAGE_TYPE: i64 = 12;
pub const LSJOB_MESSAGE_TYPE: i64 = 13;
pub const RMNODE_MESSAGE_TYPE: i64 = 14;
pub const HEARTBEAT_MESSAGE_TYPE: i64 = 20;
pub const PONG_MESSAGE_TYPE: i64 = 105;
pub const NODE_STATUS_MESSAGE_TYPE: i64 = 110;
pub const JOB_STATE_MESSAGE_TYPE: i64 = 111;

pub const PROTOCOL_VIOLATION_CODE: &str = "PROTOCOL_VIOLATION";
pub const NODE_UNAVAILABLE_CODE: &str = "NODE_UNAVAILABLE";
pub const NODE_NOT_FOUND_CODE: &str = "NODE_NOT_FOUND";
pub const JOB_NOT_FOUND_CODE: &str = "JOB_NOT_FOUND";
pub const ALREADY_TERMINAL_CODE: &str = "ALREADY_TERMINAL";
pub const INVALID_OPERATION_CODE: &str = "INVALID_OPERATION";
pub const NODE_NOT_ALLOWED_CODE: &str = "NODE_NOT_ALLOWED";
pub const REMOTE_FAILURE_CODE: &str = "REMOTE_FAILURE";

#[derive(Debug, PartialEq, Eq)]
pub enum AnonymousAction {
    Hello { request_id: String },
    Register { request_id: String, node: String },
    Attach { request_id: String },
}

#[derive(Debug, PartialEq)]
pub enum NodeAction {
    Heartbeat,
    CallSucceeded {
        request_id: String,
        result: serde_json::Value,
    },
    CallFailed {
        request_id: String,
        code: String,
        message: String,
    },
}

#[derive(Debug, PartialEq)]
pub enum OperatorAction {
    Ping { request_id: String },
    ListNodes { request_id: String },
    GetNode { request_id: String, node: String },
    Unit {
        request_id: String,
        node: String,
        operation: OperationDescriptor,
    },
    GetJob { request_id: String, job_id: JobId },
    CancelJob { request_id: String, job_id: JobId },
    ListJobs {
        request_id: String,
        node: Option<String>,
    },
    Subscribe { request_id: String },
    Unsubscribe { request_id: String },
    Status { request_id: String },
    RemoveNode { request_id: String, node: String },
}

/// Frames the agent receives from the controller once registered.
#[derive(Debug, PartialEq)]
pub enum ControllerAction {
    Call {
        request_id: String,
        operation: OperationDescriptor,
    },
    Ok {
        request_id: String,
        payload: PayloadMap,
    },
    Err {
        request_id: String,
        code: String,
        message: String,
    },
    Ignored { message_type: i64 },
}

#[derive(Debug)]
pub enum SessionError {
    Codec(CodecError),
    Envelope(EnvelopeError),
    /// The peer broke the session rules and must be torn down.
    ProtocolViolation {
        request_id: Option<String>,
        message: String,
    },
    /// A well-formed request that cannot be served; the session stays up.
    RequestRejected {
        request_id: String,
        code: &'static str,
        message: String,
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(source) => write!(f, "session codec error: {source}"),
            Self::Envelope(source) => write!(f, "session envelope error: {source}"),
            Self::ProtocolViolation {
                request_id,
                message,
            } => write!(
                f,
                "session protocol violation (rid={request_id:?}): {message}"
            ),
            Self::RequestRejected {
                request_id,
                code,
                message,
            } => write!(f, "request {request_id} rejected ({code}): {message}"),
        }
    }
}

impl std::error::Error for SessionError {}

pub fn evaluate_anonymous_frame(
    codec: &WireCodec,
    frame: &[u8],
    helloed: bool,
) -> Result<AnonymousAction, SessionError> {
    let envelope = decode_envelope(codec, frame)?;

    if !helloed {
        if envelope.message_type != HELLO_MESSAGE_TYPE {
            return Err(violation(
                &envelope,
                "HELLO must be the first message on a new connection",
            ));
        }
        return Ok(AnonymousAction::Hello {
            request_id: envelope.request_id,
        });
    }

    match envelope.message_type {
        REGISTER_MESSAGE_TYPE => {
            let node = required_string(&envelope, "node")?;
            Ok(AnonymousAction::Register {
                request_id: envelope.request_id,
                node,
            })
        }
        ATTACH_MESSAGE_TYPE => Ok(AnonymousAction::Attach {
            request_id: envelope.request_id,
        }),
        other => Err(violation(
            &envelope,
            &format!("after HELLO only REGISTER or ATTACH is allowed, got message type {other}"),
        )),
    }
}

pub fn evaluate_node_frame(codec: &WireCodec, frame: &[u8]) -> Result<NodeAction, SessionError> {
    let envelope = decode_envelope(codec, frame)?;

    match envelope.message_type {
        HEARTBEAT_MESSAGE_TYPE => Ok(NodeAction::Heartbeat),
        OK_MESSAGE_TYPE | ERR_MESSAGE_TYPE if envelope.is_signal() => Err(violation(
            &envelope,
            "call replies must carry the call id as rid",
        )),
        OK_MESSAGE_TYPE => {
            let result = payload_to_json(&envelope.payload).map_err(|reason| {
                violation(&envelope, &format!("reply payload {reason}"))
            })?;
            Ok(NodeAction::CallSucceeded {
                request_id: envelope.request_id,
                result,
            })
        }
        ERR_MESSAGE_TYPE => {
            let code = envelope
                .payload_str("code")
                .unwrap_or(REMOTE_FAILURE_CODE)
                .to_owned();
            let message = envelope
                .payload_str("message")
                .unwrap_or("remote operation failed")
                .to_owned();
            Ok(NodeAction::CallFailed {
                request_id: envelope.request_id,
                code,
                message,
            })
        }
        other => Err(violation(
            &envelope,
            &format!("message type {other} is not allowed on a node session"),
        )),
    }
}

pub fn evaluate_operator_frame(
    codec: &WireCodec,
    frame: &[u8],
) -> Result<OperatorAction, SessionError> {
    let envelope = decode_envelope(codec, frame)?;
    let request_id = envelope.request_id.clone();

    let action = match envelope.message_type {
        PING_MESSAGE_TYPE => OperatorAction::Ping { request_id },
        LSNODE_MESSAGE_TYPE => OperatorAction::ListNodes { request_id },
        NODE_MESSAGE_TYPE => OperatorAction::GetNode {
            node: required_string(&envelope, "node")?,
            request_id,
        },
        UNIT_MESSAGE_TYPE => {
            let node = required_string(&envelope, "node")?;
            let operation = OperationDescriptor::from_payload(&envelope.payload).map_err(
                |error| match error {
                    DispatchError::InvalidOperation { reason } => SessionError::RequestRejected {
                        request_id: request_id.clone(),
                        code: INVALID_OPERATION_CODE,
                        message: reason,
                    },
                    other => SessionError::RequestRejected {
                        request_id: request_id.clone(),
                        code: other.wire_code(),
                        message: other.to_string(),
                    },
                },
            )?;
            OperatorAction::Unit {
                request_id,
                node,
                operation,
            }
        }
        JOB_MESSAGE_TYPE => OperatorAction::GetJob {
            job_id: required_job_id(&envelope)?,
            request_id,
        },
        CANCEL_MESSAGE_TYPE => OperatorAction::CancelJob {
            job_id: required_job_id(&envelope)?,
            request_id,
        },
        LSJOB_MESSAGE_TYPE => OperatorAction::ListJobs {
            node: optional_string(&envelope, "node")?,
            request_id,
        },
        SUBSCRIBE_MESSAGE_TYPE => OperatorAction::Subscribe { request_id },
        UNSUBSCRIBE_MESSAGE_TYPE => OperatorAction::Unsubscribe { request_id },
        STATUS_MESSAGE_TYPE => OperatorAction::Status { request_id },
        RMNODE_MESSAGE_TYPE => OperatorAction::RemoveNode {
            node: required_string(&envelope, "node")?,
            request_id,
        },
        other => {
            return Err(violation(
                &envelope,
                &format!("message type {other} is not allowed on an operator session"),
            ))
        }
    };

    Ok(action)
}

pub fn evaluate_controller_frame(
    codec: &WireCodec,
    frame: &[u8],
) -> Result<ControllerAction, SessionError> {
    let envelope = decode_envelope(codec, frame)?;

    match envelope.message_type {
        CALL_MESSAGE_TYPE => {
            let request_id = envelope.request_id.clone();
            let operation = OperationDescriptor::from_payload(&envelope.payload).map_err(
                |error| SessionError::RequestRejected {
                    request_id: request_id.clone(),
                    code: INVALID_OPERATION_CODE,
                    message: error.to_string(),
                },
            )?;
            Ok(ControllerAction::Call {
                request_id,
                operation,
            })
        }
        OK_MESSAGE_TYPE => Ok(ControllerAction::Ok {
            request_id: envelope.request_id,
            payload: envelope.payload,
        }),
        ERR_MESSAGE_TYPE => Ok(ControllerAction::Err {
            code: envelope.payload_str("code").unwrap_or_default().to_owned(),
            message: envelope.payload_str("message").unwrap_or_default().to_owned(),
            request_id: envelope.request_id,
        }),
        other => Ok(ControllerAction::Ignored {
            message_type: other,
        }),
    }
}

pub fn build_protocol_error_frame(
    codec: &WireCodec,
    request_id: &str,
    code: &str,
    message: &str,
) -> Result<Vec<u8>, SessionError> {
    encode(
        codec,
        WireEnvelope::err(request_id, code, Some(message.to_owned()), None),
    )
}

pub fn build_ok_frame(
    codec: &WireCodec,
    request_id: &str,
    payload: PayloadMap,
) -> Result<Vec<u8>, SessionError> {
    encode(codec, WireEnvelope::ok(request_id, Some(payload)))
}

pub fn build_pong_frame(
    codec: &WireCodec,
    request_id: &str,
    server_time_rfc3339: &str,
) -> Result<Vec<u8>, SessionError> {
    let mut payload = PayloadMap::new();
    payload.insert(
        "server_time".to_owned(),
        Value::String(server_time_rfc3339.into()),
    );
    encode(codec, WireEnvelope::new(PONG_MESSAGE_TYPE, request_id, payload))
}

pub fn build_register_frame(
    codec: &WireCodec,
    request_id: &str,
    node: &str,
) -> Result<Vec<u8>, SessionError> {
    let mut payload = PayloadMap::new();
    payload.insert("node".to_owned(), Value::String(node.into()));
    encode(codec, WireEnvelope::new(REGISTER_MESSAGE_TYPE, request_id, payload))
}

pub fn build_heartbeat_frame(codec: &WireCodec) -> Result<Vec<u8>, SessionError> {
    encode(
        codec,
        WireEnvelope::signal(HEARTBEAT_MESSAGE_TYPE, PayloadMap::new()),
    )
}

pub fn build_node_status_frame(
    codec: &WireCodec,
    change: &StatusChange,
) -> Result<Vec<u8>, SessionError> {
    let mut payload = PayloadMap::new();
    payload.insert("node".to_owned(), Value::String(change.node.clone().into()));
    payload.insert("from".to_owned(), Value::String(change.from.as_str().into()));
    payload.insert("to".to_owned(), Value::String(change.to.as_str().into()));
    payload.insert("at".to_owned(), Value::String(change.at.to_rfc3339().into()));
    encode(codec, WireEnvelope::signal(NODE_STATUS_MESSAGE_TYPE, payload))
}

pub fn build_job_state_frame(codec: &WireCodec, job: &Job) -> Result<Vec<u8>, SessionError> {
    let mut payload = PayloadMap::new();
    payload.insert("jid".to_owned(), Value::from(job.id));
    payload.insert("node".to_owned(), Value::String(job.node.clone().into()));
    payload.insert("state".to_owned(), Value::String(job.state.as_str().into()));
    if let Some(error) = &job.error {
        payload.insert(
            "error_kind".to_owned(),
            Value::String(error.kind.as_str().into()),
        );
    }
    encode(codec, WireEnvelope::signal(JOB_STATE_MESSAGE_TYPE, payload))
}

/// Converts a JSON object into a reply payload; other JSON values are
/// wrapped under `value`.
pub fn json_to_payload(value: &serde_json::Value) -> PayloadMap {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(key, value)| (key.clone(), json_value_to_rmpv(value)))
            .collect(),
        other => PayloadMap::from([("value".to_owned(), json_value_to_rmpv(other))]),
    }
}

fn payload_to_json(payload: &PayloadMap) -> Result<serde_json::Value, &'static str> {
    let mut map = serde_json::Map::new();
    for (key, value) in payload {
        map.insert(key.clone(), rmpv_value_to_json(value)?);
    }
    Ok(serde_json::Value::Object(map))
}

fn decode_envelope(codec: &WireCodec, frame: &[u8]) -> Result<WireEnvelope, SessionError> {
    let raw = codec.decode_frame(frame).map_err(SessionError::Codec)?;
    WireEnvelope::from_raw(&raw).map_err(SessionError::Envelope)
}

fn encode(codec: &WireCodec, envelope: WireEnvelope) -> Result<Vec<u8>, SessionError> {
    codec
        .encode_frame(&envelope.into_raw())
        .map_err(SessionError::Codec)
}

fn violation(envelope: &WireEnvelope, message: &str) -> SessionError {
    SessionError::ProtocolViolation {
        request_id: Some(envelope.request_id.clone()),
        message: message.to_owned(),
    }
}

fn required_string(envelope: &WireEnvelope, key: &str) -> Result<String, SessionError> {
    envelope
        .payload_str(key)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| violation(envelope, &format!("payload must contain non-empty string key '{key}'")))
}

fn optional_string(envelope: &WireEnvelope, key: &str) -> Result<Option<String>, SessionError> {
    match envelope.payload.get(key) {
        None | Some(Value::Nil) => Ok(None),
        Some(_) => required_string(envelope, key).map(Some),
    }
}

fn required_job_id(envelope: &WireEnvelope) -> Result<JobId, SessionError> {
    envelope
        .payload
        .get("jid")
        .and_then(Value::as_u64)
        .filter(|jid| *jid > 0)
        .ok_or_else(|| violation(envelope, "payload must contain positive integer key 'jid'"))
}
