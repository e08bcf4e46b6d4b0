//! Operator HTTP API for command dispatch and node listing.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use nodegate_core::error::NodeGateError;

use crate::commands::CommandRequest;
use crate::state::GatewayState;

pub fn routes() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/{node_id}/connected", get(node_connected))
        .route("/api/nodes/{node_id}/commands", post(send_command))
        .route("/api/commands/broadcast", post(broadcast_command))
}

/// Maps gateway errors onto HTTP status codes.
pub struct ApiError(NodeGateError);

impl From<NodeGateError> for ApiError {
    fn from(e: NodeGateError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NodeGateError::NodeNotConnected(_) => StatusCode::NOT_FOUND,
            NodeGateError::CommandSendFailed { .. } => StatusCode::BAD_GATEWAY,
            NodeGateError::CommandTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            NodeGateError::MalformedFrame(_) | NodeGateError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendCommandBody {
    #[serde(rename = "type")]
    command_type: String,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    initiated_by: Option<String>,
    #[serde(default)]
    wait_for_response: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastBody {
    #[serde(rename = "type")]
    command_type: String,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    initiated_by: Option<String>,
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn list_nodes(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({ "nodes": state.list_connected_nodes().await }))
}

async fn node_connected(
    State(state): State<Arc<GatewayState>>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    let connected = state.is_node_connected(&node_id).await;
    Json(json!({ "nodeId": node_id, "connected": connected }))
}

async fn send_command(
    State(state): State<Arc<GatewayState>>,
    Path(node_id): Path<String>,
    Json(body): Json<SendCommandBody>,
) -> Result<Response, ApiError> {
    if body.command_type.trim().is_empty() {
        return Ok(bad_request("command type must not be empty"));
    }

    let mut request = CommandRequest::new(node_id, body.command_type)
        .parameters(body.parameters.unwrap_or_else(|| json!({})))
        .initiated_by(body.initiated_by.unwrap_or_else(|| "api".to_string()));
    if body.wait_for_response {
        request = request.wait(body.timeout_ms.map(Duration::from_millis));
    }

    let record = state.send_command(request).await?;
    Ok(Json(record).into_response())
}

async fn broadcast_command(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<BroadcastBody>,
) -> Response {
    if body.command_type.trim().is_empty() {
        return bad_request("command type must not be empty");
    }
    let summary = state
        .broadcast_command(
            &body.command_type,
            body.parameters.unwrap_or_else(|| json!({})),
            body.initiated_by.as_deref().unwrap_or("api"),
        )
        .await;
    Json(summary).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn status_and_body(err: NodeGateError) -> (StatusCode, Value) {
        let response = ApiError::from(err).into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let (status, body) = status_and_body(NodeGateError::NodeNotConnected("a".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("a"));

        let (status, _) = status_and_body(NodeGateError::CommandSendFailed {
            command_id: "c".into(),
            node_id: "a".into(),
        })
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, _) = status_and_body(NodeGateError::CommandTimedOut {
            command_id: "c".into(),
            timeout_ms: 10,
        })
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_send_body_defaults() {
        let body: SendCommandBody = serde_json::from_value(json!({"type": "status"})).unwrap();
        assert_eq!(body.command_type, "status");
        assert!(!body.wait_for_response);
        assert!(body.parameters.is_none());

        let body: SendCommandBody = serde_json::from_value(
            json!({"type": "restart", "waitForResponse": true, "timeoutMs": 500}),
        )
        .unwrap();
        assert!(body.wait_for_response);
        assert_eq!(body.timeout_ms, Some(500));
    }
}
