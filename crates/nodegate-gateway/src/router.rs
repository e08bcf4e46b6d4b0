//! Inbound frame dispatch.
//!
//! Every frame refreshes the node's liveness before it is decoded, so a
//! malformed frame still counts as activity. Frames from one connection
//! are routed in arrival order.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use nodegate_core::error::Result;
use nodegate_core::protocol::{
    HeartbeatFrame, InboundFrame, LogFrame, OutboundFrame, RegisterFrame, StatusFrame, decode_frame,
    parse_timestamp,
};
use nodegate_core::records::{LogLevel, LogRecord, NodeMetrics};
use nodegate_core::store::RecordStore;

use crate::commands::CommandEngine;
use crate::metrics;
use crate::persist::load_node;
use crate::registry::ConnectionRegistry;

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RecordStore>,
    commands: Arc<CommandEngine>,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn RecordStore>,
        commands: Arc<CommandEngine>,
    ) -> Self {
        Self {
            registry,
            store,
            commands,
        }
    }

    /// Handle one raw text frame from `node_id`. Never fails the connection.
    pub async fn route(&self, node_id: &str, text: &str) {
        self.registry.touch(node_id).await;

        let frame = match decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node_id, %e, "Dropping malformed frame");
                metrics::record_frame("malformed");
                return;
            }
        };

        let kind = frame.kind().to_string();
        metrics::record_frame(&kind);
        if let Err(e) = self.dispatch(node_id, frame).await {
            warn!(node_id, frame_type = %kind, %e, "Frame handling failed");
        }
    }

    /// Apply a decoded frame.
    pub async fn dispatch(&self, node_id: &str, frame: InboundFrame) -> Result<()> {
        match frame {
            InboundFrame::Heartbeat(hb) => self.on_heartbeat(node_id, hb).await,
            InboundFrame::Log(log) => self.on_log(node_id, log).await,
            InboundFrame::Status(status) => self.on_status(node_id, status).await,
            InboundFrame::Register(reg) => self.on_register(node_id, reg).await,
            InboundFrame::Pong(_) => {
                debug!(node_id, "Pong received");
                Ok(())
            }
            InboundFrame::CommandResponse(resp) => {
                self.commands.on_command_response(node_id, resp).await?;
                Ok(())
            }
            InboundFrame::Unknown { kind } => {
                warn!(node_id, frame_type = %kind, "Dropping frame of unknown type");
                Ok(())
            }
        }
    }

    async fn on_heartbeat(&self, node_id: &str, hb: HeartbeatFrame) -> Result<()> {
        let now = Utc::now();
        let mut node = load_node(self.store.as_ref(), node_id, now).await?;
        node.metrics = NodeMetrics {
            cpu_usage: hb.cpu_usage,
            memory_usage: hb.memory_usage,
            disk_usage: hb.disk_usage,
            uptime: hb.uptime,
        };
        if let Some(ip) = hb.ip {
            node.ip = Some(ip);
        }
        node.mark_online(now);
        self.store.save_node(&node).await?;
        debug!(node_id, cpu = hb.cpu_usage, mem = hb.memory_usage, "Heartbeat");
        Ok(())
    }

    async fn on_log(&self, node_id: &str, log: LogFrame) -> Result<()> {
        let timestamp = log
            .timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        match log.level {
            LogLevel::Warn => warn!(node_id, agent_message = %log.message, "Agent warning"),
            LogLevel::Error | LogLevel::Critical => {
                error!(node_id, level = ?log.level, agent_message = %log.message, "Agent error")
            }
            LogLevel::Debug | LogLevel::Info => {}
        }

        self.store
            .append_log(&LogRecord {
                node_id: node_id.to_string(),
                level: log.level,
                message: log.message,
                timestamp,
                metadata: log.metadata.unwrap_or_default(),
            })
            .await
    }

    async fn on_status(&self, node_id: &str, status: StatusFrame) -> Result<()> {
        let now = Utc::now();
        let mut node = load_node(self.store.as_ref(), node_id, now).await?;
        node.status = status.status;
        node.last_seen = now;
        if let Some(metadata) = status.metadata {
            node.merge_metadata(metadata);
        }
        self.store.save_node(&node).await?;
        info!(node_id, status = ?status.status, "Node status updated");
        Ok(())
    }

    async fn on_register(&self, node_id: &str, reg: RegisterFrame) -> Result<()> {
        let now = Utc::now();
        let saved: Result<()> = async {
            let mut node = load_node(self.store.as_ref(), node_id, now).await?;
            node.ip = Some(reg.ip.clone());
            if let Some(name) = reg.name.clone() {
                node.name = Some(name);
            }
            if let Some(tags) = reg.tags.clone() {
                node.tags = tags.into_iter().collect();
            }
            if let Some(metadata) = reg.metadata.clone() {
                node.merge_metadata(metadata);
            }
            node.mark_online(now);
            self.store.save_node(&node).await
        }
        .await;

        let confirmation = OutboundFrame::RegisterConfirmation {
            success: saved.is_ok(),
            timestamp: Utc::now(),
            error: saved.as_ref().err().map(|_| "Registration could not be recorded".to_string()),
        };
        if !self.registry.send(node_id, &confirmation).await {
            warn!(node_id, "Could not deliver register confirmation");
        }

        if saved.is_ok() {
            info!(node_id, ip = %reg.ip, "Node registered");
        }
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nodegate_core::config::CommandsConfig;
    use nodegate_core::error::NodeGateError;
    use nodegate_core::records::{CommandRecord, NodeRecord, NodeStatus};
    use nodegate_core::store::MemoryStore;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use crate::events::EventBus;
    use crate::registry::{ConnectionHandle, Outbound};

    fn router_with(store: Arc<dyn RecordStore>) -> (MessageRouter, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let commands = Arc::new(CommandEngine::new(
            registry.clone(),
            store.clone(),
            EventBus::default(),
            CommandsConfig::default(),
        ));
        (MessageRouter::new(registry.clone(), store, commands), registry)
    }

    async fn connect(registry: &ConnectionRegistry, node_id: &str) -> mpsc::Receiver<Outbound> {
        let (handle, rx) = ConnectionHandle::new(8);
        registry.register(node_id, handle).await;
        rx
    }

    async fn next_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.recv().await.unwrap() {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_updates_node_record() {
        let store = Arc::new(MemoryStore::new());
        let (router, registry) = router_with(store.clone());
        let _rx = connect(&registry, "agent-1").await;

        router
            .route(
                "agent-1",
                r#"{"type":"heartbeat","cpuUsage":12.5,"memoryUsage":40,"diskUsage":70,"uptime":3600,"ip":"10.0.0.9"}"#,
            )
            .await;

        let node = store.find_node("agent-1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.metrics.cpu_usage, 12.5);
        assert_eq!(node.ip.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_malformed_frame_still_refreshes_liveness() {
        let store = Arc::new(MemoryStore::new());
        let (router, registry) = router_with(store.clone());
        let _rx = connect(&registry, "agent-1").await;

        let old = Utc::now() - chrono::Duration::seconds(300);
        registry.touch_at("agent-1", old).await;
        router.route("agent-1", "{not json").await;

        let nodes = registry.list().await;
        assert!(nodes[0].last_activity > old);
        assert!(store.nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let (router, registry) = router_with(store.clone());
        let _rx = connect(&registry, "agent-1").await;

        router.route("agent-1", r#"{"type":"telemetry","x":1}"#).await;
        assert!(store.nodes().await.is_empty());
        assert!(store.logs().await.is_empty());
    }

    #[tokio::test]
    async fn test_log_is_forwarded_with_agent_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let (router, registry) = router_with(store.clone());
        let _rx = connect(&registry, "agent-1").await;

        router
            .route(
                "agent-1",
                r#"{"type":"log","level":"error","message":"disk full","timestamp":"2024-05-01T10:00:00Z","metadata":{"mount":"/"}}"#,
            )
            .await;

        let logs = store.logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[0].message, "disk full");
        assert_eq!(logs[0].timestamp.timestamp(), 1_714_557_600);
        assert_eq!(logs[0].metadata["mount"], "/");
    }

    #[tokio::test]
    async fn test_status_merges_metadata() {
        let store = Arc::new(MemoryStore::new());
        let mut node = NodeRecord::new("agent-1", Utc::now());
        node.metadata.insert("os".into(), "linux".into());
        store.save_node(&node).await.unwrap();

        let (router, registry) = router_with(store.clone());
        let _rx = connect(&registry, "agent-1").await;
        router
            .route("agent-1", r#"{"type":"status","status":"warning","metadata":{"reason":"load"}}"#)
            .await;

        let node = store.find_node("agent-1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Warning);
        assert_eq!(node.metadata["os"], "linux");
        assert_eq!(node.metadata["reason"], "load");
    }

    #[tokio::test]
    async fn test_register_upserts_and_confirms() {
        let store = Arc::new(MemoryStore::new());
        let (router, registry) = router_with(store.clone());
        let mut rx = connect(&registry, "agent-1").await;

        router
            .route(
                "agent-1",
                r#"{"type":"register","ip":"10.0.0.5","name":"edge-1","tags":["edge","eu"]}"#,
            )
            .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "register_confirmation");
        assert_eq!(reply["success"], true);

        let node = store.find_node("agent-1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(node.name.as_deref(), Some("edge-1"));
        assert!(node.tags.contains("eu"));
    }

    struct FailingStore;

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn find_node(&self, _: &str) -> nodegate_core::error::Result<Option<NodeRecord>> {
            Ok(None)
        }
        async fn save_node(&self, _: &NodeRecord) -> nodegate_core::error::Result<()> {
            Err(NodeGateError::Store("disk on fire".into()))
        }
        async fn find_command(&self, _: &str) -> nodegate_core::error::Result<Option<CommandRecord>> {
            Ok(None)
        }
        async fn save_command(&self, _: &CommandRecord) -> nodegate_core::error::Result<()> {
            Err(NodeGateError::Store("disk on fire".into()))
        }
        async fn append_log(&self, _: &LogRecord) -> nodegate_core::error::Result<()> {
            Err(NodeGateError::Store("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn test_register_failure_is_reported_to_agent() {
        let (router, registry) = router_with(Arc::new(FailingStore));
        let mut rx = connect(&registry, "agent-1").await;

        router
            .route("agent-1", r#"{"type":"register","ip":"10.0.0.5"}"#)
            .await;

        let reply = next_json(&mut rx).await;
        assert_eq!(reply["success"], false);
        assert!(reply["error"].is_string());
        assert!(registry.is_connected("agent-1").await);
    }

    #[tokio::test]
    async fn test_command_response_for_unknown_command() {
        let store = Arc::new(MemoryStore::new());
        let (router, _registry) = router_with(store);
        let err = router
            .dispatch(
                "agent-1",
                decode_frame(r#"{"type":"command_response","commandId":"missing","success":true}"#)
                    .unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeGateError::UnknownCommandResponse(_)));
    }
}
