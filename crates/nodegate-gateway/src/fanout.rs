//! Command fan-out to every connected node.

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::commands::{CommandEngine, CommandRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSummary {
    pub sent: usize,
    pub total: usize,
    pub failure_count: usize,
}

impl CommandEngine {
    /// Send a fire-and-forget command to every node in the registry.
    ///
    /// Sends run concurrently; one node failing does not affect the others.
    pub async fn broadcast_command(
        &self,
        command_type: &str,
        parameters: Value,
        initiated_by: &str,
    ) -> BroadcastSummary {
        let node_ids = self.registry().node_ids().await;
        let total = node_ids.len();

        let sends = node_ids.iter().map(|node_id| {
            let request = CommandRequest::new(node_id, command_type)
                .parameters(parameters.clone())
                .initiated_by(initiated_by);
            async move { (node_id, self.send_command(request).await) }
        });
        let results = join_all(sends).await;

        let mut sent = 0;
        for (node_id, result) in results {
            match result {
                Ok(_) => sent += 1,
                Err(e) => warn!(node_id = %node_id, command = command_type, %e, "Broadcast send failed"),
            }
        }

        let summary = BroadcastSummary {
            sent,
            total,
            failure_count: total - sent,
        };
        info!(command = command_type, sent, total, "Broadcast command");
        summary
    }
}
