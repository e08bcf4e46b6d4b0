//! Per-node WebSocket connection lifecycle.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use nodegate_core::protocol::{CLOSE_SUPERSEDED, OutboundFrame};

use crate::events::GatewayEvent;
use crate::registry::{ConnectionHandle, Outbound};
use crate::state::GatewayState;
use crate::{metrics, persist};

/// How long teardown waits for queued frames to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Drive one authenticated node connection until it closes.
pub async fn handle_node_connection(state: Arc<GatewayState>, node_id: String, ws: WebSocket) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (handle, mut out_rx) = ConnectionHandle::new(state.gateway.outbound_buffer);
    let conn_id = handle.conn_id().to_string();
    let closed = handle.closed_token();

    if let Some(previous) = state.registry.register(&node_id, handle.clone()).await {
        info!(node_id = %node_id, old_conn_id = %previous.conn_id(), "Node reconnected, closing superseded connection");
        previous.close(CLOSE_SUPERSEDED, "superseded by a newer connection");
    }
    info!(node_id = %node_id, conn_id = %conn_id, "Node connected");
    metrics::set_connected_nodes(state.registry.len().await);
    state.events.publish(GatewayEvent::NodeConnected {
        node_id: node_id.clone(),
    });

    // Writer task: the only place this socket is written
    let mut send_task = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            match out {
                Outbound::Text(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    if !handle.send_frame(&OutboundFrame::ping()) {
        warn!(node_id = %node_id, "Could not queue initial ping");
    }

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!(node_id = %node_id, conn_id = %conn_id, "Connection closed by gateway");
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.router.route(&node_id, text.as_str()).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(node_id = %node_id, "Dropping binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(node_id = %node_id, ?frame, "Node closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(node_id = %node_id, %e, "WebSocket error");
                    break;
                }
                None => break,
            }
        }
    }

    // Only the connection that still owns the entry marks the node offline
    if state.registry.release(&node_id, &conn_id).await.is_some() {
        persist::mark_offline(state.store.as_ref(), &node_id, Utc::now()).await;
        state.events.publish(GatewayEvent::NodeDisconnected {
            node_id: node_id.clone(),
        });
        info!(node_id = %node_id, conn_id = %conn_id, "Node disconnected");
    } else {
        debug!(node_id = %node_id, conn_id = %conn_id, "Connection ended after being replaced or evicted");
    }
    metrics::set_connected_nodes(state.registry.len().await);

    drop(handle);
    if tokio::time::timeout(WRITER_DRAIN, &mut send_task).await.is_err() {
        send_task.abort();
    }
}
