//! Connection handlers for the courier server.
//!
//! This module terminates WebSocket connections, binds each one to a user
//! identity, and feeds inbound frames to the core router. It also exposes
//! the HTTP history endpoints over the storage collaborator.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use courier_core::{
    spawn_persist_worker, AckAggregator, Connection, ConnectionError, DeliveryEngine,
    MemoryStorage, MessageRouter, SessionRegistry, Storage,
};
use courier_protocol::{codec, Message};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The frame router.
    pub router: MessageRouter,
    /// Delivery engine, kept for the pending gauge and shutdown.
    pub delivery: Arc<DeliveryEngine>,
    /// Storage backend, queried by the HTTP endpoints.
    pub storage: Arc<dyn Storage>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state. Must be called inside a tokio runtime, since it
    /// spawns the persistence worker.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let delivery = Arc::new(DeliveryEngine::new(
            Arc::clone(&registry),
            config.delivery_config(),
        ));
        let aggregator = Arc::new(AckAggregator::new(
            Arc::clone(&registry),
            config.aggregator_config(),
        ));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (persist, _worker) = spawn_persist_worker(Arc::clone(&storage));
        let router = MessageRouter::new(registry, Arc::clone(&delivery), aggregator, persist);

        Self {
            router,
            delivery,
            storage,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/history", get(history_handler))
        .route("/api/unread", get(unread_handler))
        .with_state(Arc::clone(&state));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}?username=<user>",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cancel outstanding retry timers before the process exits
    state.delivery.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Deserialize)]
struct HistoryParams {
    user1: String,
    user2: String,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

/// Conversation history between two users, most recent first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    match state
        .storage
        .history(&params.user1, &params.user2, params.limit)
        .await
    {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => {
            error!(error = %e, "History query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(Deserialize)]
struct UnreadParams {
    username: String,
}

/// Unread messages for a user, most recent first.
async fn unread_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UnreadParams>,
) -> Response {
    match state.storage.unread(&params.username).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => {
            error!(error = %e, "Unread query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(Deserialize)]
struct WsParams {
    username: String,
}

/// WebSocket upgrade handler. The identity is bound at upgrade time from the
/// `username` query parameter.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, params.username))
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, username: String) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sink, mut stream) = socket.split();
    let connection: Arc<dyn Connection> = Arc::new(WsConnection::new(sink));

    debug!(user = %username, "WebSocket connected");
    state
        .router
        .connection_opened(&username, Arc::clone(&connection))
        .await;

    while let Some(result) = stream.next().await {
        match result {
            Ok(WsMessage::Text(text)) => {
                let start = Instant::now();

                if text.len() > state.config.limits.max_message_size {
                    warn!(user = %username, size = text.len(), "Frame too large, dropping");
                    metrics::record_error("oversized_frame");
                    continue;
                }

                match codec::decode(&text) {
                    Ok(frame) => {
                        metrics::record_message("inbound");
                        state.router.dispatch(&username, &connection, frame).await;
                        metrics::set_pending_deliveries(state.delivery.pending_count());
                    }
                    Err(e) => {
                        // Malformed frames are dropped; the connection stays open
                        warn!(user = %username, error = %e, "Malformed frame, dropping");
                        metrics::record_error("malformed_frame");
                    }
                }

                metrics::record_dispatch_latency(start.elapsed().as_secs_f64());
            }
            Ok(WsMessage::Binary(_)) => {
                warn!(user = %username, "Binary frame on a text protocol, dropping");
                metrics::record_error("binary_frame");
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => {
                // Socket-level keepalive is handled underneath us
            }
            Ok(WsMessage::Close(_)) => {
                debug!(user = %username, "Received close frame");
                break;
            }
            Err(e) => {
                warn!(user = %username, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    state.router.connection_closed(&username, &connection).await;
    metrics::set_pending_deliveries(state.delivery.pending_count());
    debug!(user = %username, "WebSocket disconnected");
}

/// A live WebSocket connection handle.
///
/// The sink mutex serializes writes: it is held for one frame write only,
/// so retry timers, broadcasts, and the read task can all send through the
/// same handle without interleaving partial frames.
struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    open: AtomicBool,
}

impl WsConnection {
    fn new(sink: SplitSink<WebSocket, WsMessage>) -> Self {
        Self {
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        let text =
            codec::encode(message).map_err(|e| ConnectionError::SendFailed(e.to_string()))?;

        let mut sink = self.sink.lock().await;
        match sink.send(WsMessage::Text(text)).await {
            Ok(()) => {
                metrics::record_message("outbound");
                Ok(())
            }
            Err(e) => {
                self.open.store(false, Ordering::Release);
                Err(ConnectionError::SendFailed(e.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.open.store(false, Ordering::Release);
        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }
}
