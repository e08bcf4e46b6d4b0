use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeGateError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Node not connected: {0}")]
    NodeNotConnected(String),

    #[error("Failed to send command {command_id} to node {node_id}")]
    CommandSendFailed { command_id: String, node_id: String },

    #[error("Command {command_id} timed out after {timeout_ms}ms")]
    CommandTimedOut { command_id: String, timeout_ms: u64 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unknown command response: {0}")]
    UnknownCommandResponse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NodeGateError>;
