//! Liveness sweep.
//!
//! On a fixed interval every registry entry whose last activity is older
//! than the timeout is removed, closed, and marked offline in the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nodegate_core::config::HeartbeatConfig;
use nodegate_core::protocol::CLOSE_HEARTBEAT_TIMEOUT;
use nodegate_core::store::RecordStore;

use crate::events::{EventBus, GatewayEvent};
use crate::registry::ConnectionRegistry;
use crate::{metrics, persist};

/// A node removed by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub node_id: String,
    pub last_activity: DateTime<Utc>,
}

pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RecordStore>,
    events: EventBus,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn RecordStore>,
        events: EventBus,
        config: &HeartbeatConfig,
    ) -> Self {
        if config.interval_secs == 0 || config.timeout_secs == 0 {
            warn!(
                interval_secs = config.interval_secs,
                timeout_secs = config.timeout_secs,
                "Zero heartbeat setting, using one second"
            );
        }
        Self {
            registry,
            store,
            events,
            interval: config.interval(),
            timeout: config.timeout(),
        }
    }

    /// Run sweeps until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                timeout_secs = self.timeout.as_secs(),
                "Heartbeat monitor started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            // First tick fires immediately; nothing can be stale yet
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Heartbeat monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }

    pub async fn sweep(&self) -> Vec<Eviction> {
        self.sweep_at(Utc::now()).await
    }

    /// Evict every node silent for longer than the timeout as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<Eviction> {
        let Ok(timeout) = chrono::Duration::from_std(self.timeout) else {
            warn!("Heartbeat timeout out of range, skipping sweep");
            return Vec::new();
        };
        let cutoff = now - timeout;

        let candidates = self.registry.stale_since(cutoff).await;
        if candidates.is_empty() {
            debug!("Heartbeat sweep: all nodes live");
            return Vec::new();
        }

        let mut evicted = Vec::with_capacity(candidates.len());
        for (node_id, conn_id) in candidates {
            let Some(entry) = self.registry.evict_if_stale(&node_id, &conn_id, cutoff).await else {
                continue;
            };

            warn!(
                node_id = %node_id,
                last_activity = %entry.last_activity,
                "Node missed heartbeat deadline, evicting"
            );
            entry.handle.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
            persist::mark_offline(self.store.as_ref(), &node_id, entry.last_activity).await;
            self.events.publish(GatewayEvent::NodeEvicted {
                node_id: node_id.clone(),
                last_seen: entry.last_activity,
            });
            metrics::record_eviction();

            evicted.push(Eviction {
                node_id,
                last_activity: entry.last_activity,
            });
        }

        metrics::set_connected_nodes(self.registry.len().await);
        evicted
    }
}
