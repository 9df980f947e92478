//! HTTP surface for the Beacon server.
//!
//! `GET /ws?token=...&format=json|binary` upgrades to a WebSocket session;
//! `GET /health` reports the latest service health records.

use crate::config::Config;
use crate::engine::Engine;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use beacon_transport::websocket::WebSocketConfig;
use beacon_transport::{WebSocketConnection, WireFormat};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// The running engine.
    pub engine: Arc<Engine>,
    /// Inbound message size limit.
    pub max_message_size: usize,
}

/// Query parameters of the WebSocket upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Credential exchanged with the identity collaborator.
    pub token: Option<String>,
    /// `binary` (default) or `json`.
    pub format: Option<String>,
}

/// Build the HTTP router.
pub fn router(config: &Config, engine: Arc<Engine>) -> Router {
    let state = AppState {
        engine,
        max_message_size: config.transport.max_message_size,
    };
    Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until the engine begins shutting down.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server(config: Config, engine: Arc<Engine>) -> Result<()> {
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Beacon server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, router(&config, Arc::clone(&engine)), engine).await
}

/// Serve a router on a bound listener.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, app: Router, engine: Arc<Engine>) -> Result<()> {
    let stop = engine.shutdown_token();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { stop.cancelled().await })
    .await
    .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state.engine.health_report();
    let status = if report["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    if state.engine.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let format = match params.format.as_deref().map(str::parse::<WireFormat>) {
        None => WireFormat::default(),
        Some(Ok(format)) => format,
        Some(Err(err)) => {
            warn!(remote = %addr, error = %err, "Rejected upgrade");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    let config = WebSocketConfig {
        max_message_size: state.max_message_size,
        format,
    };
    debug!(remote = %addr, format = ?format, "Upgrading connection");

    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let mut connection = WebSocketConnection::new(socket, config).with_remote_addr(addr);
            if let Some(token) = params.token {
                connection = connection.with_credential(token);
            }
            state.engine.handle_connection(Box::new(connection)).await;
        })
}
