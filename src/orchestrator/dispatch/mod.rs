use std::fmt;

use chrono::{DateTime, Utc};
use rmpv::Value;
use serde_json::Map;

use crate::orchestrator::jobs::{JobId, JobManager};
use crate::orchestrator::nodes::NodeRegistry;
use crate::peers::PeerRegistry;
use crate::wire::codec::{json_value_to_rmpv, rmpv_value_to_json, CodecError, WireCodec};
use crate::wire::envelope::{PayloadMap, WireEnvelope};

pub const CALL_MESSAGE_TYPE: i64 = 40;

/// Boolean `args` keys a unit operation may carry. Each one maps to the
/// `systemctl` option of the same name with `_` spelled `-`.
pub const ALLOWED_FLAGS: &[&str] = &["force", "no_block", "now", "quiet", "runtime"];
/// List of property names, only meaningful for `get_properties`.
pub const PROPERTIES_ARG: &str = "properties";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitVerb {
    Start,
    Stop,
    Restart,
    Reload,
    Enable,
    Disable,
    GetProperties,
}

impl UnitVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::GetProperties => "get_properties",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "reload" => Some(Self::Reload),
            "enable" => Some(Self::Enable),
            "disable" => Some(Self::Disable),
            "get_properties" => Some(Self::GetProperties),
            _ => None,
        }
    }
}

/// Opaque description of one unit operation, carried to the node as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationDescriptor {
    pub verb: UnitVerb,
    pub unit: String,
    pub args: Map<String, serde_json::Value>,
}

impl OperationDescriptor {
    pub fn new(verb: UnitVerb, unit: impl Into<String>) -> Self {
        Self {
            verb,
            unit: unit.into(),
            args: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Map<String, serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.unit.is_empty() || self.unit.len() > 256 {
            return Err(DispatchError::InvalidOperation {
                reason: "unit name must be 1-256 bytes".to_owned(),
            });
        }
        if self.unit.starts_with('-')
            || self.unit.chars().any(|c| c.is_whitespace() || c == '/' || c.is_control())
        {
            return Err(DispatchError::InvalidOperation {
                reason: format!("unit name '{}' contains forbidden characters", self.unit),
            });
        }
        for (key, value) in &self.args {
            if key == PROPERTIES_ARG && self.verb == UnitVerb::GetProperties {
                validate_property_names(value)?;
            } else if !ALLOWED_FLAGS.contains(&key.as_str()) {
                return Err(DispatchError::InvalidOperation {
                    reason: format!("unsupported argument '{key}' for {}", self.verb.as_str()),
                });
            } else if !value.is_boolean() {
                return Err(DispatchError::InvalidOperation {
                    reason: format!("argument '{key}' must be a boolean"),
                });
            }
        }
        Ok(())
    }

    pub fn to_payload(&self) -> PayloadMap {
        let mut payload = PayloadMap::new();
        payload.insert("verb".to_owned(), Value::String(self.verb.as_str().into()));
        payload.insert("unit".to_owned(), Value::String(self.unit.clone().into()));
        if !self.args.is_empty() {
            payload.insert(
                "args".to_owned(),
                json_value_to_rmpv(&serde_json::Value::Object(self.args.clone())),
            );
        }
        payload
    }

    pub fn from_payload(payload: &PayloadMap) -> Result<Self, DispatchError> {
        let verb = payload
            .get("verb")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("payload.verb must be a string"))?;
        let verb = UnitVerb::from_wire(verb)
            .ok_or_else(|| invalid(&format!("unsupported verb '{verb}'")))?;
        let unit = payload
            .get("unit")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("payload.unit must be a string"))?;

        let args = match payload.get("args") {
            None | Some(Value::Nil) => Map::new(),
            Some(value) => match rmpv_value_to_json(value) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => return Err(invalid("payload.args must be a map")),
                Err(reason) => return Err(invalid(&format!("payload.args {reason}"))),
            },
        };

        let operation = Self::new(verb, unit).with_args(args);
        operation.validate()?;
        Ok(operation)
    }
}

#[derive(Debug)]
pub enum DispatchError {
    NodeUnavailable { node: String },
    InvalidOperation { reason: String },
    Encode(CodecError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeUnavailable { node } => write!(f, "node '{node}' has no live peer"),
            Self::InvalidOperation { reason } => write!(f, "invalid operation: {reason}"),
            Self::Encode(source) => write!(f, "failed to encode call frame: {source}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl DispatchError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::NodeUnavailable { .. } => "NODE_UNAVAILABLE",
            Self::InvalidOperation { .. } | Self::Encode(_) => "INVALID_OPERATION",
        }
    }
}

/// Sends `operation` to the peer currently bound to `node`.
///
/// A node without a live peer fails fast and leaves no job behind. Otherwise
/// the call frame is encoded first, the job is created pending, and only then
/// is the frame queued on the peer, tagged with a call id that maps the
/// eventual reply back to the job. Transport failures while writing surface
/// on the peer and are handled by the peer teardown path.
pub fn dispatch(
    peers: &mut PeerRegistry,
    nodes: &NodeRegistry,
    jobs: &mut JobManager,
    codec: &WireCodec,
    node: &str,
    operation: OperationDescriptor,
    now: DateTime<Utc>,
) -> Result<JobId, DispatchError> {
    operation.validate()?;
    if !nodes.status(node).is_connected() {
        return Err(DispatchError::NodeUnavailable {
            node: node.to_owned(),
        });
    }
    let peer = nodes
        .bound_peer(node)
        .and_then(|peer_id| peers.get_mut(peer_id))
        .filter(|peer| peer.is_usable())
        .ok_or_else(|| DispatchError::NodeUnavailable {
            node: node.to_owned(),
        })?;

    let call_id = peer.next_call_id();
    let frame = build_call_frame(codec, &call_id, &operation).map_err(DispatchError::Encode)?;

    let job_id = jobs.create(node, operation, now);
    peer.register_call(call_id, job_id);
    peer.send_frame(&frame);
    Ok(job_id)
}

pub fn build_call_frame(
    codec: &WireCodec,
    call_id: &str,
    operation: &OperationDescriptor,
) -> Result<Vec<u8>, CodecError> {
    codec.encode_frame(&WireEnvelope::new(CALL_MESSAGE_TYPE, call_id, operation.to_payload()).into_raw())
}

fn validate_property_names(value: &serde_json::Value) -> Result<(), DispatchError> {
    let names = value
        .as_array()
        .ok_or_else(|| invalid("properties must be a list of names"))?;
    for name in names {
        let well_formed = name
            .as_str()
            .is_some_and(|name| !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric()));
        if !well_formed {
            return Err(invalid(&format!("invalid property name {name}")));
        }
    }
    Ok(())
}

fn invalid(reason: &str) -> DispatchError {
    DispatchError::InvalidOperation {
        reason: reason.to_owned(),
    }
}
