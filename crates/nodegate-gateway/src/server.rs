//! Axum-based WebSocket server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::authenticate;
use crate::connection::handle_node_connection;
use crate::state::GatewayState;
use crate::{api, metrics};

/// Build the HTTP router: `/ws` for nodes, `/health`, and the operator API.
pub fn router(state: Arc<GatewayState>) -> Router {
    #[allow(unused_mut)]
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes());

    #[cfg(feature = "metrics")]
    if let Some(handle) = state.metrics_handle.clone() {
        app = app.route("/metrics", get(move || async move { handle.render() }));
    }

    app.with_state(state).layer(TraceLayer::new_for_http())
}

/// Start the gateway on the configured bind address and `port`.
///
/// Runs until Ctrl+C or until `state.shutdown` is cancelled.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.bind_addr());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<GatewayState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let monitor = state.heartbeat.clone().spawn(state.shutdown.clone());
    let app = router(state.clone());

    let shutdown_state = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let token = shutdown_state.shutdown.clone();
        tokio::select! {
            _ = shutdown => {}
            _ = token.cancelled() => {}
        }
        shutdown_state.begin_shutdown().await;
    })
    .await?;

    state.begin_shutdown().await;
    if let Err(e) = monitor.await {
        warn!(%e, "Heartbeat monitor task failed");
    }
    info!("Gateway stopped");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.check(remote.ip()) {
            metrics::record_rejected_upgrade("rate_limit");
            return (StatusCode::TOO_MANY_REQUESTS, "too many connection attempts").into_response();
        }
    }

    let node_id = match authenticate(&headers, state.node_secret.as_deref()) {
        Ok(node_id) => node_id,
        Err(e) => {
            warn!(%remote, %e, "Rejected node upgrade");
            metrics::record_rejected_upgrade("auth");
            return (
                StatusCode::UNAUTHORIZED,
                [(header::CONNECTION, "close")],
                "authentication failed",
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_node_connection(state, node_id, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let nodes = state.registry.len().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "nodes": nodes,
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
