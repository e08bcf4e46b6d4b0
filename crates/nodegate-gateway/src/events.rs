//! In-process event bus for node lifecycle and command completion.
//!
//! Subscribers are optional; publishing with no receivers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use nodegate_core::records::CommandStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum GatewayEvent {
    #[serde(rename = "node.connected")]
    NodeConnected {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    #[serde(rename = "node.disconnected")]
    NodeDisconnected {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    #[serde(rename = "node.evicted")]
    NodeEvicted {
        #[serde(rename = "nodeId")]
        node_id: String,
        #[serde(rename = "lastSeen")]
        last_seen: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "command.completed")]
    CommandCompleted {
        #[serde(rename = "commandId")]
        command_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        status: CommandStatus,
    },
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeConnected { .. } => "node.connected",
            Self::NodeDisconnected { .. } => "node.disconnected",
            Self::NodeEvicted { .. } => "node.evicted",
            Self::CommandCompleted { .. } => "command.completed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: GatewayEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => debug!(event = name, receivers, "Published event"),
            Err(_) => debug!(event = name, "No event subscribers"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
