//! Best-effort mirroring of gateway state into the record store.
//!
//! Store failures are logged here and never propagate into registry or
//! command-table transitions.

use chrono::{DateTime, Utc};
use tracing::error;

use nodegate_core::error::Result;
use nodegate_core::records::{CommandRecord, NodeRecord};
use nodegate_core::store::RecordStore;

/// Fetch a node record, or a fresh one first seen at `now`.
pub async fn load_node(store: &dyn RecordStore, node_id: &str, now: DateTime<Utc>) -> Result<NodeRecord> {
    Ok(store
        .find_node(node_id)
        .await?
        .unwrap_or_else(|| NodeRecord::new(node_id, now)))
}

async fn try_mark_offline(store: &dyn RecordStore, node_id: &str, last_seen: DateTime<Utc>) -> Result<()> {
    let mut node = load_node(store, node_id, last_seen).await?;
    node.mark_offline(last_seen);
    store.save_node(&node).await
}

pub async fn mark_offline(store: &dyn RecordStore, node_id: &str, last_seen: DateTime<Utc>) {
    if let Err(e) = try_mark_offline(store, node_id, last_seen).await {
        error!(node_id, %e, "Failed to mark node offline");
    }
}

pub async fn save_command(store: &dyn RecordStore, record: &CommandRecord) {
    if let Err(e) = store.save_command(record).await {
        error!(
            command_id = %record.command_id,
            status = %record.status,
            %e,
            "Failed to persist command record"
        );
    }
}
