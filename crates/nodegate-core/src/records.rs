//! Durable records mirrored to the external store.
//!
//! The gateway never reads these for routing decisions. They are
//! best-effort mirrors of in-memory state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    #[default]
    Offline,
    Warning,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub uptime: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    #[serde(default)]
    pub metrics: NodeMetrics,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NodeRecord {
    /// A fresh record for a node first seen at `now`.
    pub fn new(node_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            name: None,
            ip: None,
            status: NodeStatus::Offline,
            last_seen: now,
            first_seen: now,
            metrics: NodeMetrics::default(),
            tags: BTreeSet::new(),
            metadata: Map::new(),
        }
    }

    pub fn mark_online(&mut self, now: DateTime<Utc>) {
        self.status = NodeStatus::Online;
        self.last_seen = now;
    }

    /// Mark offline; `last_seen` is the last confirmed-live instant.
    pub fn mark_offline(&mut self, last_seen: DateTime<Utc>) {
        self.status = NodeStatus::Offline;
        self.last_seen = last_seen;
    }

    /// Shallow-merge metadata keys into the record.
    pub fn merge_metadata(&mut self, metadata: Map<String, Value>) {
        self.metadata.extend(metadata);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Successful,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::Timeout)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    ///
    /// `timeout -> successful|failed` is the one post-terminal step: a late
    /// response is still recorded.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Sent, Successful)
                | (Sent, Failed)
                | (Sent, Timeout)
                | (Timeout, Successful)
                | (Timeout, Failed)
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command_id: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub parameters: Value,
    pub initiated_by: String,
    pub status: CommandStatus,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub sent: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandRecord {
    pub fn new(
        command_id: impl Into<String>,
        node_id: impl Into<String>,
        command_type: impl Into<String>,
        parameters: Value,
        initiated_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            node_id: node_id.into(),
            command_type: command_type.into(),
            parameters,
            initiated_by: initiated_by.into(),
            status: CommandStatus::Pending,
            created: now,
            sent: None,
            completed: None,
            result: None,
            error: None,
        }
    }

    fn advance(&mut self, next: CommandStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                command_id = %self.command_id,
                from = %self.status,
                to = %next,
                "Rejected command status transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> bool {
        let ok = self.advance(CommandStatus::Sent);
        if ok {
            self.sent = Some(now);
        }
        ok
    }

    pub fn mark_send_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        let ok = self.advance(CommandStatus::Failed);
        if ok {
            self.error = Some(error.into());
            self.completed = Some(now);
        }
        ok
    }

    pub fn mark_timeout(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        let ok = self.advance(CommandStatus::Timeout);
        if ok {
            self.error = Some(error.into());
            self.completed = Some(now);
        }
        ok
    }

    /// Apply an agent's response.
    pub fn complete(
        &mut self,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let next = if success {
            CommandStatus::Successful
        } else {
            CommandStatus::Failed
        };
        let ok = self.advance(next);
        if ok {
            self.result = result;
            self.error = error;
            self.completed = Some(now);
        }
        ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "trace")]
    Debug,
    /// Also catches levels outside this set, such as `notice`.
    #[serde(other)]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
    #[serde(alias = "fatal")]
    Critical,
}

impl LogLevel {
    /// Levels re-emitted on the gateway's own log.
    pub fn is_elevated(self) -> bool {
        self >= LogLevel::Warn
    }
}

/// One agent log line, as forwarded to the log store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub node_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}
