//! Node wire protocol.
//!
//! Agents and the gateway exchange newline-free JSON text frames over a
//! WebSocket. Every frame carries a `type` tag; inbound frames decode into
//! [`InboundFrame`], outbound frames are built from [`OutboundFrame`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{NodeGateError, Result};
use crate::records::{LogLevel, NodeStatus};

/// Header carrying the connecting node's identifier.
pub const NODE_ID_HEADER: &str = "x-node-id";

/// Header carrying the shared node secret.
pub const NODE_SECRET_HEADER: &str = "x-node-secret";

/// Close code sent when the heartbeat monitor evicts a silent node.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Close code sent to a connection replaced by a newer one for the same node.
pub const CLOSE_SUPERSEDED: u16 = 4001;

/// Close code sent to every node when the gateway shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

const KNOWN_TYPES: [&str; 6] = [
    "heartbeat",
    "log",
    "status",
    "register",
    "pong",
    "command_response",
];

/// A frame received from a node.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Heartbeat(HeartbeatFrame),
    Log(LogFrame),
    Status(StatusFrame),
    Register(RegisterFrame),
    Pong(PongFrame),
    CommandResponse(CommandResponseFrame),
    /// A well-formed envelope whose `type` is not one we handle.
    #[serde(skip_deserializing)]
    Unknown { kind: String },
}

impl InboundFrame {
    /// Wire name of the frame type.
    pub fn kind(&self) -> &str {
        match self {
            Self::Heartbeat(_) => "heartbeat",
            Self::Log(_) => "log",
            Self::Status(_) => "status",
            Self::Register(_) => "register",
            Self::Pong(_) => "pong",
            Self::CommandResponse(_) => "command_response",
            Self::Unknown { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatFrame {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub uptime: f64,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogFrame {
    pub level: LogLevel,
    pub message: String,
    /// RFC 3339 string or epoch milliseconds.
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusFrame {
    pub status: NodeStatus,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterFrame {
    pub ip: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PongFrame {
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponseFrame {
    pub command_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Decode one inbound text frame.
///
/// Unparsable JSON, a missing `type`, or a known `type` with the wrong shape
/// is [`NodeGateError::MalformedFrame`]. An unrecognised `type` decodes to
/// [`InboundFrame::Unknown`].
pub fn decode_frame(text: &str) -> Result<InboundFrame> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| NodeGateError::MalformedFrame(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| NodeGateError::MalformedFrame("missing string `type` field".into()))?;

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Ok(InboundFrame::Unknown { kind });
    }

    serde_json::from_value(value).map_err(|e| NodeGateError::MalformedFrame(format!("{kind}: {e}")))
}

/// A frame sent from the gateway to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Ping {
        timestamp: DateTime<Utc>,
    },
    Command {
        #[serde(rename = "commandId")]
        command_id: String,
        command: String,
        parameters: Value,
        timestamp: DateTime<Utc>,
    },
    RegisterConfirmation {
        success: bool,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OutboundFrame {
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Interpret an agent-supplied timestamp (RFC 3339 string or epoch millis).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
