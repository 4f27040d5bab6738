//! Connection handlers for the Duet server.
//!
//! Each WebSocket connection runs one task that owns the socket and the
//! receiving half of its session queue. Inbound frames are dispatched to the
//! router; deliveries the router pushes into the queue are written back out
//! in the client's current encoding.

use crate::config::{Config, StoreBackend};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use duet_core::{
    Delivery, MemoryStore, MessageStore, Router as DuetRouter, RouterConfig, RouterError,
    SendOutcome, SessionHandle, SessionId, SledStore,
};
use duet_protocol::codec::{self, Encoding, ProtocolError};
use duet_protocol::{codes, AckStatus, Frame};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The message router.
    pub router: DuetRouter,
    /// Server configuration.
    pub config: Config,
    connections: AtomicUsize,
}

impl AppState {
    /// Create app state backed by the store selected in `config.store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable store cannot be opened.
    pub fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn MessageStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sled => Arc::new(SledStore::open(config.store.resolved_path())?),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create app state around an existing store.
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn MessageStore>) -> Self {
        let router_config = RouterConfig {
            store_timeout: config.store_timeout(),
            max_rooms_per_session: config.limits.max_rooms_per_connection,
            ..RouterConfig::default()
        };

        Self {
            router: DuetRouter::with_config(store, router_config),
            config,
            connections: AtomicUsize::new(0),
        }
    }

    /// Number of open WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    fn try_admit(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(ConnectionSlot {
            state: Arc::clone(self),
        })
    }
}

/// One admitted connection; releases its slot when dropped.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP application.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Serve the application on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Duet server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state, shutdown_signal()).await?;

    info!("Duet server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Router statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "connections": state.connection_count(),
        "router": state.router.stats(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = state.try_admit() else {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached, rejecting upgrade"
        );
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    ws.max_message_size(codec::MAX_FRAME_SIZE + codec::LENGTH_PREFIX_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
        .into_response()
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let session = SessionId::generate();
    let (handle, mut outbound) =
        SessionHandle::channel(session.clone(), state.config.limits.outbound_queue);
    state.router.on_connect(handle);
    debug!(session = %session, "WebSocket connected");

    let (sink, mut stream) = socket.split();
    let mut conn = Connection {
        session: session.clone(),
        state: Arc::clone(&state),
        sink,
        encoding: Encoding::default(),
        read_buffer: BytesMut::with_capacity(4096),
    };

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    if let Err(e) = conn.send(&Frame::connected(session.as_str(), heartbeat)).await {
        error!(session = %session, error = %e, "Failed to send Connected frame");
        state.router.on_disconnect(&session);
        return;
    }

    let idle_timeout = state.config.idle_timeout();
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        let result = tokio::select! {
            biased;

            Some(delivery) = outbound.recv() => conn.push(delivery).await,

            msg = stream.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_frame(data.len(), "inbound");
                        conn.on_binary(&data).await
                    }
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_frame(text.len(), "inbound");
                        conn.on_text(&text).await
                    }
                    Some(Ok(Message::Ping(data))) => conn
                        .sink
                        .send(Message::Pong(data))
                        .await
                        .map_err(anyhow::Error::from),
                    Some(Ok(Message::Pong(_))) => Ok(()),
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session, "WebSocket stream ended");
                        break;
                    }
                }
            }

            () = &mut idle => {
                info!(session = %session, timeout = ?idle_timeout, "Closing idle connection");
                let _ = conn.sink.send(Message::Close(None)).await;
                break;
            }
        };

        if let Err(e) = result {
            warn!(session = %session, error = %e, "Connection write failed");
            break;
        }
    }

    state.router.on_disconnect(&session);
    metrics::set_online_users(state.router.stats().online_users);

    debug!(session = %session, "WebSocket disconnected");
}

/// Per-connection state owned by the connection task.
struct Connection {
    session: SessionId,
    state: Arc<AppState>,
    sink: SplitSink<WebSocket, Message>,
    /// Encoding of the last inbound frame; used for replies and pushes.
    encoding: Encoding,
    /// Read buffer for length-prefixed frames split across messages.
    read_buffer: BytesMut,
}

impl Connection {
    /// Send a frame in the current encoding.
    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let (message, len) = match self.encoding {
            Encoding::Binary => {
                let data = codec::encode(frame)?;
                let len = data.len();
                (Message::Binary(data.to_vec()), len)
            }
            Encoding::Text => {
                let text = codec::encode_json(frame)?;
                let len = text.len();
                (Message::Text(text), len)
            }
        };

        metrics::record_frame(len, "outbound");
        self.sink.send(message).await?;
        Ok(())
    }

    /// Write a router delivery to the socket.
    async fn push(&mut self, delivery: Delivery) -> Result<()> {
        let frame = match delivery {
            Delivery::Message(message) => Frame::ReceiveMessage { message },
            Delivery::Backlog(messages) => Frame::ReceiveBacklog { messages },
            Delivery::Deleted(notice) => Frame::MessageDeleted { notice },
        };
        self.send(&frame).await
    }

    async fn on_binary(&mut self, data: &[u8]) -> Result<()> {
        self.encoding = Encoding::Binary;
        let limit = self.state.config.limits.max_message_size;
        if data.len() > limit {
            return self
                .malformed(format!("Message of {} bytes exceeds limit of {limit}", data.len()))
                .await;
        }

        self.read_buffer.extend_from_slice(data);
        loop {
            match codec::decode_from(&mut self.read_buffer) {
                Ok(Some(frame)) => self.dispatch(frame).await?,
                Ok(None) => break,
                Err(ProtocolError::FrameTooLarge(size)) => {
                    self.read_buffer.clear();
                    return self
                        .malformed(format!("Frame of {size} bytes exceeds limit"))
                        .await;
                }
                Err(e) => self.malformed(e.to_string()).await?,
            }
        }

        // A partial frame larger than one message can never become valid.
        if self.read_buffer.len() > limit {
            self.read_buffer.clear();
            return self
                .malformed(format!("Partial frame exceeds limit of {limit} bytes"))
                .await;
        }
        Ok(())
    }

    async fn on_text(&mut self, text: &str) -> Result<()> {
        self.encoding = Encoding::Text;
        let limit = self.state.config.limits.max_message_size;
        if text.len() > limit {
            return self
                .malformed(format!("Message of {} bytes exceeds limit of {limit}", text.len()))
                .await;
        }

        match codec::decode_json(text) {
            Ok(frame) => self.dispatch(frame).await,
            Err(e) => self.malformed(e.to_string()).await,
        }
    }

    /// Handle a decoded frame and send its reply, if any.
    async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        let start = Instant::now();
        debug!(session = %self.session, event = frame.event(), "Frame received");

        let reply = match frame {
            Frame::Join {
                id,
                user_id,
                target_user_id,
            } => match self
                .state
                .router
                .on_join(&self.session, &user_id, &target_user_id)
                .await
            {
                Ok(outcome) => {
                    metrics::record_backlog(outcome.backlog);
                    metrics::set_online_users(self.state.router.stats().online_users);
                    id.map(|id| Frame::ack(id, AckStatus::Joined))
                }
                Err(e) => Some(self.error_frame(id, &e)),
            },

            Frame::SendMessage { id, message } => {
                match self.state.router.on_send(Some(&self.session), message).await {
                    Ok(SendOutcome::Delivered(fanout)) => {
                        metrics::record_routed("live");
                        metrics::record_skipped(fanout.skipped);
                        id.map(|id| Frame::ack(id, AckStatus::Delivered))
                    }
                    Ok(SendOutcome::Stored { .. }) => {
                        metrics::record_routed("stored");
                        id.map(|id| Frame::ack(id, AckStatus::Stored))
                    }
                    Err(e) => Some(self.error_frame(id, &e)),
                }
            }

            Frame::DeleteMessage { id, notice } => {
                match self.state.router.on_delete(Some(&self.session), notice) {
                    Ok(fanout) => {
                        metrics::record_deletion();
                        metrics::record_skipped(fanout.skipped);
                        id.map(|id| Frame::ack(id, AckStatus::Deleted))
                    }
                    Err(e) => Some(self.error_frame(id, &e)),
                }
            }

            Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

            Frame::Pong { .. } => None,

            other => {
                warn!(session = %self.session, event = other.event(), "Unexpected client event");
                metrics::record_error("unexpected_event");
                Some(Frame::error(
                    other.request_id().unwrap_or(0),
                    codes::MALFORMED,
                    format!("Unexpected event: {}", other.event()),
                ))
            }
        };

        metrics::record_latency(start.elapsed().as_secs_f64());

        if let Some(reply) = reply {
            self.send(&reply).await?;
        }
        Ok(())
    }

    fn error_frame(&self, id: Option<u64>, err: &RouterError) -> Frame {
        let (code, kind) = match err {
            RouterError::Validation(_) => (codes::VALIDATION, "validation"),
            RouterError::StorageUnavailable(_) => (codes::STORAGE_UNAVAILABLE, "storage"),
            RouterError::SessionGone(_) | RouterError::UnknownSession(_) => {
                (codes::INTERNAL, "internal")
            }
        };
        warn!(session = %self.session, code, error = %err, "Request failed");
        metrics::record_error(kind);
        Frame::error(id.unwrap_or(0), code, err.to_string())
    }

    async fn malformed(&mut self, reason: String) -> Result<()> {
        warn!(session = %self.session, reason = %reason, "Malformed frame");
        metrics::record_error("malformed");
        self.send(&Frame::error(0, codes::MALFORMED, reason)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config
    }

    #[test]
    fn test_connection_slots_respect_limit() {
        let mut config = memory_config();
        config.limits.max_connections = 2;
        let state = Arc::new(AppState::new(config).unwrap());

        let first = state.try_admit().unwrap();
        let _second = state.try_admit().unwrap();
        assert!(state.try_admit().is_none());
        assert_eq!(state.connection_count(), 2);

        drop(first);
        assert_eq!(state.connection_count(), 1);
        assert!(state.try_admit().is_some());
    }

    #[test]
    fn test_router_uses_configured_limits() {
        let mut config = memory_config();
        config.store.timeout_ms = 250;
        config.limits.max_rooms_per_connection = 3;
        let state = AppState::new(config).unwrap();

        assert_eq!(state.router.store().name(), "memory");
        assert_eq!(state.router.config().store_timeout, Duration::from_millis(250));
        assert_eq!(state.router.config().max_rooms_per_session, 3);
    }
}
