//! Connection handlers for Parley server.
//!
//! This module handles the connection lifecycle: one task per WebSocket,
//! decoding inbound frames into hub events and writing the connection's
//! outbound queue back to the socket.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
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
use futures_util::{SinkExt, StreamExt};
use parley_core::{CollaborationHub, Session};
use parley_protocol::{FrameCodec, ProtocolError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Longest a single socket write may block before the peer is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared server state.
pub struct AppState {
    /// The collaboration hub.
    pub hub: CollaborationHub,
    /// Inbound frame codec.
    pub codec: FrameCodec,
    /// Server configuration.
    pub config: Config,
    /// Open WebSocket connections.
    active: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            hub: CollaborationHub::with_config(config.hub_config()),
            codec: FrameCodec::with_max_frame_size(config.limits.max_message_size),
            config,
            active: AtomicUsize::new(0),
        }
    }
}

/// A reserved connection slot, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl ConnectionSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Self {
            state: Arc::clone(state),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::AcqRel);
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

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rooms", get(rooms_handler))
        .with_state(state)
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Room snapshot handler.
async fn rooms_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.rooms())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = ConnectionSlot::acquire(&state) else {
        warn!(
            max = state.config.limits.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_rejected();
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, slot))
        .into_response()
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut session, mut outbound) = state.hub.open_session();
    let connection_id = session.connection_id().clone();

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = state.config.heartbeat.interval().map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let idle_timeout = state.config.heartbeat.timeout();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Frames queued for this connection by the hub
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // The hub dropped our handle: superseded, or the queue overflowed.
                    debug!(connection = %connection_id, "Handle dropped by hub, closing");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                metrics::record_frame(frame.len(), "outbound");
                let write = sender.send(Message::Text(frame.to_string()));
                match tokio::time::timeout(WRITE_TIMEOUT, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!(connection = %connection_id, "Socket write timed out");
                        metrics::record_error("write_timeout");
                        break;
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &mut session, text.as_bytes());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_frame(&state, &mut session, &data);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        // Pongs to client pings are sent by axum
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = tick(&mut heartbeat) => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            _ = idle(idle_timeout.map(|timeout| last_seen + timeout)) => {
                debug!(connection = %connection_id, "Idle timeout, closing");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.hub.disconnect(session);
    metrics::set_hub_gauges(&state.hub.stats());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode one inbound frame and apply it to the hub.
///
/// Undecodable frames and rejected events are dropped; the connection stays open.
fn handle_frame(state: &AppState, session: &mut Session, data: &[u8]) {
    let start = std::time::Instant::now();
    metrics::record_frame(data.len(), "inbound");

    let event = match state.codec.decode(data) {
        Ok(event) => event,
        Err(e) => {
            let reason = match e {
                ProtocolError::FrameTooLarge { .. } => "too_large",
                ProtocolError::Malformed(_) => "malformed",
                ProtocolError::EmptyField(_) => "invalid",
            };
            debug!(connection = %session.connection_id(), error = %e, "Dropping inbound frame");
            metrics::record_dropped(reason);
            return;
        }
    };

    let kind = event.kind();
    if let Err(e) = state.hub.handle_event(session, event) {
        debug!(connection = %session.connection_id(), event = kind, error = %e, "Event rejected");
        metrics::record_dropped("rejected");
    }

    metrics::set_hub_gauges(&state.hub.stats());
    metrics::record_latency(start.elapsed().as_secs_f64());
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatConfig;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: 0,
            heartbeat: HeartbeatConfig {
                interval_ms: 0,
                timeout_ms: 0,
            },
            ..Default::default()
        }
    }

    /// Start a server on a free port, return its address.
    async fn start_test_server(config: Config) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(config));
        tokio::spawn(async move {
            serve(listener, state).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr) -> WsClient {
        let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        ws
    }

    async fn send(ws: &mut WsClient, value: Value) {
        ws.send(WsMessage::Text(value.to_string())).await.unwrap();
    }

    /// Read the next JSON event, skipping control frames.
    async fn next_event(ws: &mut WsClient) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn expect_closed(ws: &mut WsClient) {
        loop {
            match timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for close")
            {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(WsMessage::Text(text))) => panic!("Unexpected event: {}", text),
                Some(Ok(_)) => {}
            }
        }
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn identify(ws: &mut WsClient, user_id: &str, username: &str) -> Value {
        send(
            ws,
            json!({"type": "user_connect", "userId": user_id, "username": username}),
        )
        .await;
        next_event(ws).await
    }

    #[tokio::test]
    async fn test_chat_over_websocket() {
        let addr = start_test_server(test_config()).await;
        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;

        let rooms = identify(&mut alice, "u1", "Alice").await;
        assert_eq!(rooms, json!({"type": "rooms_list", "rooms": []}));
        identify(&mut bob, "u2", "Bob").await;

        send(&mut alice, json!({"type": "create_room", "name": "general"})).await;
        let created = next_event(&mut alice).await;
        assert_eq!(created["type"], "room_created");
        assert_eq!(created["room"]["private"], false);
        let room_id = created["room"]["id"].as_str().unwrap().to_string();

        send(&mut alice, json!({"type": "join_room", "roomId": room_id})).await;
        let joined = next_event(&mut alice).await;
        assert_eq!(joined["type"], "room_joined");
        assert_eq!(joined["users"], json!(["Alice"]));

        send(&mut bob, json!({"type": "join_room", "roomId": room_id})).await;
        assert_eq!(next_event(&mut bob).await["type"], "room_joined");
        assert_eq!(
            next_event(&mut alice).await,
            json!({"type": "user_joined", "username": "Bob", "users": ["Alice", "Bob"]})
        );

        send(&mut bob, json!({"type": "send_message", "message": "hi"})).await;
        for ws in [&mut alice, &mut bob] {
            let event = next_event(ws).await;
            assert_eq!(event["type"], "new_message");
            assert_eq!(event["message"]["content"], "hi");
            assert_eq!(event["message"]["userId"], "u2");
            assert_eq!(event["message"]["username"], "Bob");
        }

        bob.close(None).await.unwrap();
        assert_eq!(
            next_event(&mut alice).await,
            json!({"type": "user_left", "username": "Bob", "users": ["Alice"]})
        );
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_connection_open() {
        let addr = start_test_server(test_config()).await;
        let mut ws = connect(addr).await;

        ws.send(WsMessage::Text("not json".into())).await.unwrap();
        send(&mut ws, json!({"type": "teleport"})).await;
        send(&mut ws, json!({"type": "join_room"})).await;
        // Precondition violation: not identified yet.
        send(&mut ws, json!({"type": "get_rooms"})).await;

        let rooms = identify(&mut ws, "u1", "Alice").await;
        assert_eq!(rooms["type"], "rooms_list");
    }

    #[tokio::test]
    async fn test_reconnect_closes_superseded_socket() {
        let addr = start_test_server(test_config()).await;
        let mut first = connect(addr).await;
        let mut second = connect(addr).await;

        identify(&mut first, "u1", "Alice").await;
        identify(&mut second, "u1", "Alice").await;

        expect_closed(&mut first).await;

        send(&mut second, json!({"type": "get_rooms"})).await;
        assert_eq!(next_event(&mut second).await["type"], "rooms_list");
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = Config {
            limits: crate::config::LimitsConfig {
                max_connections: 1,
                ..Default::default()
            },
            ..test_config()
        };
        let addr = start_test_server(config).await;
        let mut first = connect(addr).await;

        match connect_async(format!("ws://{}/ws", addr)).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 503);
            }
            other => panic!("Expected 503, got {:?}", other.map(|_| ())),
        }

        first.close(None).await.unwrap();
        expect_closed(&mut first).await;
        // The slot is released once the server task ends.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut again = connect(addr).await;
        identify(&mut again, "u1", "Alice").await;
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let config = Config {
            heartbeat: HeartbeatConfig {
                interval_ms: 0,
                timeout_ms: 100,
            },
            ..test_config()
        };
        let addr = start_test_server(config).await;
        let mut ws = connect(addr).await;

        expect_closed(&mut ws).await;
    }

    #[tokio::test]
    async fn test_health_and_rooms_endpoints() {
        let addr = start_test_server(test_config()).await;

        let health = http_get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains(r#""status":"ok""#));

        let mut ws = connect(addr).await;
        identify(&mut ws, "u1", "Alice").await;
        send(&mut ws, json!({"type": "create_room", "name": "ops", "private": true})).await;
        next_event(&mut ws).await;

        let rooms = http_get(addr, "/rooms").await;
        assert!(rooms.starts_with("HTTP/1.1 200"));
        assert!(rooms.contains(r#""name":"ops""#));
        assert!(rooms.contains(r#""private":true"#));
        assert!(rooms.contains(r#""userCount":0"#));
    }
}
