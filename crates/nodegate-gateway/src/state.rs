//! Gateway shared state.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use nodegate_core::config::{Config, GatewayConfig};
use nodegate_core::error::Result;
use nodegate_core::protocol::CLOSE_GOING_AWAY;
use nodegate_core::records::CommandRecord;
use nodegate_core::store::RecordStore;

use crate::commands::{CommandEngine, CommandRequest};
use crate::events::EventBus;
use crate::fanout::BroadcastSummary;
use crate::heartbeat::HeartbeatMonitor;
use crate::rate_limit::RateLimiter;
use crate::registry::{ConnectedNode, ConnectionRegistry};
use crate::router::MessageRouter;

/// Shared gateway state accessible from all connections and handlers.
///
/// One instance per running gateway; dropping it releases every component.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub gateway: GatewayConfig,
    pub node_secret: Option<String>,
    pub store: Arc<dyn RecordStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub commands: Arc<CommandEngine>,
    pub router: MessageRouter,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub events: EventBus,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub shutdown: CancellationToken,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, store: Arc<dyn RecordStore>) -> Self {
        let gateway = config.gateway();
        let node_secret = config.node_secret();

        // Set up rate limiter from config
        let rate_limiter = gateway
            .rate_limit
            .as_ref()
            .map(|rl| Arc::new(RateLimiter::new(rl.max_connections_per_ip)));

        let events = EventBus::default();
        let registry = Arc::new(ConnectionRegistry::new());
        let commands = Arc::new(CommandEngine::new(
            registry.clone(),
            store.clone(),
            events.clone(),
            gateway.commands.clone(),
        ));
        let router = MessageRouter::new(registry.clone(), store.clone(), commands.clone());
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            store.clone(),
            events.clone(),
            &gateway.heartbeat,
        ));

        Self {
            config,
            gateway,
            node_secret,
            store,
            registry,
            commands,
            router,
            heartbeat,
            events,
            rate_limiter,
            shutdown: CancellationToken::new(),
            #[cfg(feature = "metrics")]
            metrics_handle: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub async fn send_command(&self, request: CommandRequest) -> Result<CommandRecord> {
        self.commands.send_command(request).await
    }

    pub async fn broadcast_command(
        &self,
        command_type: &str,
        parameters: Value,
        initiated_by: &str,
    ) -> BroadcastSummary {
        self.commands
            .broadcast_command(command_type, parameters, initiated_by)
            .await
    }

    pub async fn is_node_connected(&self, node_id: &str) -> bool {
        self.registry.is_connected(node_id).await
    }

    pub async fn list_connected_nodes(&self) -> Vec<ConnectedNode> {
        self.registry.list().await
    }

    /// Stop the heartbeat monitor and close every node connection.
    pub async fn begin_shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let closed = self
            .registry
            .close_all(CLOSE_GOING_AWAY, "gateway shutting down")
            .await;
        info!(closed, "Closed node connections for shutdown");
    }
}
