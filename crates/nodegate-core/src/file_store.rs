//! File-backed record store.
//!
//! Layout:
//! - `<base>/nodes/<node_id>.json`: one `NodeRecord` per file
//! - `<base>/commands/<command_id>.json`: one `CommandRecord` per file
//! - `<base>/logs/<node_id>.jsonl`: one `LogRecord` per line
//!
//! Ids are percent-encoded into file names, so distinct ids never share a
//! file. Record files are replaced atomically on every save.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{NodeGateError, Result};
use crate::records::{CommandRecord, LogRecord, NodeRecord};
use crate::store::RecordStore;

pub struct FileStore {
    base: PathBuf,
    /// Serializes record writes so temp files are never shared.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            write_lock: Mutex::new(()),
        }
    }

    fn node_path(&self, node_id: &str) -> PathBuf {
        self.base
            .join("nodes")
            .join(format!("{}.json", encode_file_name(node_id)))
    }

    fn command_path(&self, command_id: &str) -> PathBuf {
        self.base
            .join("commands")
            .join(format!("{}.json", encode_file_name(command_id)))
    }

    fn log_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    fn log_path(&self, node_id: &str) -> PathBuf {
        self.log_dir().join(format!("{}.jsonl", encode_file_name(node_id)))
    }

    /// Read every log line stored for `node_id`.
    pub async fn read_logs(&self, node_id: &str) -> Result<Vec<LogRecord>> {
        let path = self.log_path(node_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut entries = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogRecord = serde_json::from_str(line)
                .map_err(|e| NodeGateError::Store(format!("corrupt log line: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn write_record<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        let data = serde_json::to_string_pretty(record)?;
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Atomic write: write to temp then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = tokio::fs::read_to_string(path).await?;
    Ok(Some(serde_json::from_str(&data)?))
}

/// Node ids come from agents; keep them inside the store and distinct.
fn encode_file_name(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

#[async_trait]
impl RecordStore for FileStore {
    async fn find_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        read_record(&self.node_path(node_id)).await
    }

    async fn save_node(&self, node: &NodeRecord) -> Result<()> {
        self.write_record(&self.node_path(&node.node_id), node).await?;
        debug!(node_id = %node.node_id, "Saved node record");
        Ok(())
    }

    async fn find_command(&self, command_id: &str) -> Result<Option<CommandRecord>> {
        read_record(&self.command_path(command_id)).await
    }

    async fn save_command(&self, command: &CommandRecord) -> Result<()> {
        self.write_record(&self.command_path(&command.command_id), command)
            .await?;
        debug!(command_id = %command.command_id, status = %command.status, "Saved command record");
        Ok(())
    }

    async fn append_log(&self, log: &LogRecord) -> Result<()> {
        tokio::fs::create_dir_all(self.log_dir()).await?;
        let line = serde_json::to_string(log)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&log.node_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}
