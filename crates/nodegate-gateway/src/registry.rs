//! Connection registry: the single owner of live node connections.
//!
//! Every other component reaches a node through the registry by node id.
//! Handles never leave it except as clones used to close a connection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use nodegate_core::protocol::OutboundFrame;

/// Work item for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Write side of one node connection.
///
/// Sends are a single non-blocking `try_send` into the connection's bounded
/// outbound queue; a full or closed queue rejects the frame.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: String,
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            conn_id: Uuid::new_v4().to_string(),
            tx,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Cancelled once the gateway closes this connection.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_writable(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    pub fn try_send_text(&self, text: String) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.tx.try_send(Outbound::Text(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %self.conn_id, "Outbound queue full, frame rejected");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_frame(&self, frame: &OutboundFrame) -> bool {
        match frame.to_text() {
            Ok(text) => self.try_send_text(text),
            Err(e) => {
                error!(%e, "Failed to serialize outbound frame");
                false
            }
        }
    }

    /// Ask the writer to send a close frame and stop the read loop.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.tx.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.closed.cancel();
    }
}

/// A registry entry.
#[derive(Debug, Clone)]
pub struct NodeConnection {
    pub node_id: String,
    pub handle: ConnectionHandle,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Listing row for operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedNode {
    pub node_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub total: usize,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, NodeConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` for `node_id`, returning the handle it superseded.
    pub async fn register(&self, node_id: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let now = Utc::now();
        let previous = self.entries.write().await.insert(
            node_id.to_string(),
            NodeConnection {
                node_id: node_id.to_string(),
                handle,
                connected_at: now,
                last_activity: now,
            },
        );
        previous.map(|p| p.handle)
    }

    /// Refresh liveness. Returns false if the node is not registered.
    pub async fn touch(&self, node_id: &str) -> bool {
        self.touch_at(node_id, Utc::now()).await
    }

    pub async fn touch_at(&self, node_id: &str, at: DateTime<Utc>) -> bool {
        match self.entries.write().await.get_mut(node_id) {
            Some(entry) => {
                entry.last_activity = at;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, node_id: &str) -> Option<NodeConnection> {
        self.entries.write().await.remove(node_id)
    }

    /// Remove the entry only if it still belongs to connection `conn_id`.
    ///
    /// A superseded or evicted connection tearing down must not remove the
    /// entry that replaced it.
    pub async fn release(&self, node_id: &str, conn_id: &str) -> Option<NodeConnection> {
        let mut entries = self.entries.write().await;
        if entries.get(node_id).is_some_and(|e| e.handle.conn_id() == conn_id) {
            entries.remove(node_id)
        } else {
            None
        }
    }

    /// Entries whose last activity is before `cutoff`, as (node id, conn id).
    pub async fn stale_since(&self, cutoff: DateTime<Utc>) -> Vec<(String, String)> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.last_activity < cutoff)
            .map(|e| (e.node_id.clone(), e.handle.conn_id().to_string()))
            .collect()
    }

    /// Remove an entry if it is the same connection and still stale.
    ///
    /// The staleness check is repeated under the write lock, so a touch that
    /// lands after the sweep snapshot keeps the node alive.
    pub async fn evict_if_stale(
        &self,
        node_id: &str,
        conn_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Option<NodeConnection> {
        let mut entries = self.entries.write().await;
        let still_stale = entries
            .get(node_id)
            .is_some_and(|e| e.handle.conn_id() == conn_id && e.last_activity < cutoff);
        if still_stale {
            entries.remove(node_id)
        } else {
            debug!(node_id, "Node became active before eviction");
            None
        }
    }

    pub async fn is_connected(&self, node_id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(node_id)
            .is_some_and(|e| e.handle.is_writable())
    }

    /// Hand a frame to the node's writer. False if absent or not writable.
    pub async fn send(&self, node_id: &str, frame: &OutboundFrame) -> bool {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!(%e, "Failed to serialize outbound frame");
                return false;
            }
        };
        self.send_text(node_id, text).await
    }

    pub async fn send_text(&self, node_id: &str, text: String) -> bool {
        match self.entries.read().await.get(node_id) {
            Some(entry) => entry.handle.try_send_text(text),
            None => false,
        }
    }

    pub async fn broadcast(&self, frame: &OutboundFrame) -> BroadcastOutcome {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!(%e, "Failed to serialize broadcast frame");
                return BroadcastOutcome {
                    delivered: 0,
                    total: self.len().await,
                };
            }
        };

        let entries = self.entries.read().await;
        let delivered = entries
            .values()
            .filter(|e| e.handle.try_send_text(text.clone()))
            .count();
        debug!(delivered, total = entries.len(), "Broadcast frame");
        BroadcastOutcome {
            delivered,
            total: entries.len(),
        }
    }

    pub async fn list(&self) -> Vec<ConnectedNode> {
        let mut nodes: Vec<ConnectedNode> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| ConnectedNode {
                node_id: e.node_id.clone(),
                connected_at: e.connected_at,
                last_activity: e.last_activity,
                connected: e.handle.is_writable(),
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub async fn node_ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Close every connection and clear the table.
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let drained: Vec<NodeConnection> = self.entries.write().await.drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.handle.close(code, reason);
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ping() -> OutboundFrame {
        OutboundFrame::ping()
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::new(8);
        assert!(registry.register("agent-1", handle).await.is_none());

        assert!(registry.is_connected("agent-1").await);
        assert!(registry.send("agent-1", &ping()).await);

        match rx.recv().await.unwrap() {
            Outbound::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "ping");
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_absent_node_fails() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send("ghost", &ping()).await);
        assert!(!registry.is_connected("ghost").await);
        assert!(!registry.touch("ghost").await);
    }

    #[tokio::test]
    async fn test_register_twice_replaces() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = ConnectionHandle::new(8);
        let (second, _rx2) = ConnectionHandle::new(8);
        let first_id = first.conn_id().to_string();

        registry.register("agent-1", first).await;
        let replaced = registry.register("agent-1", second.clone()).await.unwrap();
        assert_eq!(replaced.conn_id(), first_id);
        assert_eq!(registry.len().await, 1);

        // The superseded connection's teardown leaves the new entry alone
        assert!(registry.release("agent-1", &first_id).await.is_none());
        assert!(registry.is_connected("agent-1").await);
        assert!(registry.release("agent-1", second.conn_id()).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_entry() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = ConnectionHandle::new(8);
        registry.register("agent-1", handle).await;
        drop(rx);

        assert!(!registry.send("agent-1", &ping()).await);
        assert!(!registry.is_connected("agent-1").await);
        assert_eq!(registry.len().await, 1);

        let listed = registry.list().await;
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].connected);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(1);
        registry.register("agent-1", handle).await;

        assert!(registry.send("agent-1", &ping()).await);
        assert!(!registry.send("agent-1", &ping()).await);
        assert!(registry.is_connected("agent-1").await);
    }

    #[tokio::test]
    async fn test_broadcast_counts_deliveries() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = ConnectionHandle::new(8);
        let (b, _rx_b) = ConnectionHandle::new(8);
        let (c, rx_c) = ConnectionHandle::new(8);
        registry.register("a", a).await;
        registry.register("b", b).await;
        registry.register("c", c).await;
        drop(rx_c);

        let frame = OutboundFrame::Command {
            command_id: "x".into(),
            command: "status".into(),
            parameters: json!({}),
            timestamp: Utc::now(),
        };
        let outcome = registry.broadcast(&frame).await;
        assert_eq!(outcome, BroadcastOutcome { delivered: 2, total: 3 });
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(8);
        registry.register("agent-1", handle).await;
        assert!(registry.remove("agent-1").await.is_some());
        assert!(registry.remove("agent-1").await.is_none());
    }

    #[tokio::test]
    async fn test_evict_rechecks_activity() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = ConnectionHandle::new(8);
        let conn_id = handle.conn_id().to_string();
        registry.register("agent-1", handle).await;

        let old = Utc::now() - chrono::Duration::seconds(120);
        registry.touch_at("agent-1", old).await;
        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(registry.stale_since(cutoff).await.len(), 1);

        // A touch between snapshot and eviction wins
        registry.touch("agent-1").await;
        assert!(registry.evict_if_stale("agent-1", &conn_id, cutoff).await.is_none());
        assert!(registry.is_connected("agent-1").await);
    }

    #[tokio::test]
    async fn test_close_marks_handle_unwritable() {
        let (handle, mut rx) = ConnectionHandle::new(8);
        handle.close(4000, "heartbeat timeout");
        handle.close(4000, "again");
        assert!(!handle.is_writable());
        assert!(!handle.try_send_text("late".into()));
        assert!(handle.closed_token().is_cancelled());

        match rx.recv().await.unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 4000);
                assert_eq!(reason, "heartbeat timeout");
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_all_drains() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = ConnectionHandle::new(8);
        let token = a.closed_token();
        registry.register("a", a).await;
        assert_eq!(registry.close_all(1001, "shutdown").await, 1);
        assert!(token.is_cancelled());
        assert!(registry.is_empty().await);
    }
}
