//! Persistence collaborator for node, command, and log records.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::records::{CommandRecord, LogRecord, NodeRecord};

/// External record store. The gateway only uses simple find/save calls.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_node(&self, node_id: &str) -> Result<Option<NodeRecord>>;
    async fn save_node(&self, node: &NodeRecord) -> Result<()>;
    async fn find_command(&self, command_id: &str) -> Result<Option<CommandRecord>>;
    async fn save_command(&self, command: &CommandRecord) -> Result<()>;
    async fn append_log(&self, log: &LogRecord) -> Result<()>;
}

/// In-process store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<String, NodeRecord>>,
    commands: RwLock<HashMap<String, CommandRecord>>,
    logs: RwLock<Vec<LogRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored log line, oldest first.
    pub async fn logs(&self) -> Vec<LogRecord> {
        self.logs.read().await.clone()
    }

    pub async fn nodes(&self) -> Vec<NodeRecord> {
        self.nodes.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        Ok(self.nodes.read().await.get(node_id).cloned())
    }

    async fn save_node(&self, node: &NodeRecord) -> Result<()> {
        self.nodes
            .write()
            .await
            .insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn find_command(&self, command_id: &str) -> Result<Option<CommandRecord>> {
        Ok(self.commands.read().await.get(command_id).cloned())
    }

    async fn save_command(&self, command: &CommandRecord) -> Result<()> {
        self.commands
            .write()
            .await
            .insert(command.command_id.clone(), command.clone());
        Ok(())
    }

    async fn append_log(&self, log: &LogRecord) -> Result<()> {
        self.logs.write().await.push(log.clone());
        Ok(())
    }
}
