//! WebSocket dispatcher
//!
//! Per-connection read/write pumps and protocol routing. The read side
//! parses typed frames and translates them into hub and store calls; the
//! write side drains the bounded outbound queue, batching pending frames
//! into one transport write separated by newlines.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, TokenAuthority};
use crate::hub::{self, ConnectionIdentity, HubHandle, OutboundFrame, OutboundSender};
use crate::protocol::{Message, MessageType, MAX_MESSAGE_SIZE};
use crate::store::{DeviceInfo, SessionSnapshot, StateStore};

/// Write deadline per frame.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// The read side must see at least one frame within this window.
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Transport-level ping cadence.
const PING_PERIOD: Duration = Duration::from_secs(30);

/// Shared dependencies for the dispatcher.
#[derive(Clone)]
pub struct WsState {
    pub hub: HubHandle,
    pub store: StateStore,
    pub authority: Arc<TokenAuthority>,
    pub allowed_origins: Arc<Vec<String>>,
}

/// Upgrade handler. The Origin header is mandatory and must match an
/// allowed origin exactly; suffix tricks like `https://app.example.com.evil`
/// never match.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if origin.is_empty()
        || !state
            .allowed_origins
            .iter()
            .any(|o| o.eq_ignore_ascii_case(origin))
    {
        warn!(target: "ws", origin, "websocket upgrade rejected: origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Mutable per-connection view held by the read task. The hub keeps its own
/// registry entry; this is the dispatcher's working state.
struct ConnectionState {
    connection_id: String,
    user_id: String,
    session_id: String,
    device_id: String,
    is_authenticated: bool,
    connected_at: DateTime<Utc>,
    last_ping: DateTime<Utc>,
}

async fn handle_socket(socket: WebSocket, state: WsState, remote_addr: SocketAddr) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = hub::outbound_channel();

    let connection_id = Uuid::new_v4().to_string();
    state.hub.register(connection_id.clone(), tx.clone());

    let write_task = tokio::spawn(write_pump(sink, rx));

    let mut conn = ConnectionState {
        connection_id: connection_id.clone(),
        user_id: String::new(),
        session_id: String::new(),
        device_id: String::new(),
        is_authenticated: false,
        connected_at: Utc::now(),
        last_ping: Utc::now(),
    };

    loop {
        let next = match timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                info!(
                    target: "ws",
                    connection_id = %conn.connection_id,
                    last_ping = %conn.last_ping,
                    "read idle timeout, closing connection"
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(msg))) => msg,
        };

        let text = match next {
            WsMessage::Text(text) => text,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {
                conn.last_ping = Utc::now();
                continue;
            }
            WsMessage::Binary(_) => continue,
            WsMessage::Close(_) => break,
        };

        if text.len() > MAX_MESSAGE_SIZE {
            warn!(
                target: "ws",
                connection_id = %conn.connection_id,
                size = text.len(),
                "oversized frame, closing connection"
            );
            break;
        }

        let message: Message = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(_) => {
                warn!(
                    target: "ws",
                    connection_id = %conn.connection_id,
                    "malformed frame, closing connection"
                );
                break;
            }
        };

        if !dispatch(&state, &mut conn, &tx, remote_addr, message).await {
            break;
        }
    }

    state.hub.unregister(conn.connection_id.clone());
    drop(tx);
    let _ = write_task.await;
}

/// Route one inbound frame. Returns false when the connection should close.
async fn dispatch(
    state: &WsState,
    conn: &mut ConnectionState,
    tx: &OutboundSender,
    remote_addr: SocketAddr,
    message: Message,
) -> bool {
    let Some(kind) = message.message_type() else {
        // Unknown ids are tolerated so new message kinds can ship
        // client-first.
        warn!(
            target: "ws",
            connection_id = %conn.connection_id,
            message_type = message.kind,
            "unknown message type, ignoring"
        );
        return true;
    };

    match kind {
        MessageType::Heartbeat => handle_heartbeat(state, conn, tx, &message).await,
        MessageType::Auth => handle_auth(state, conn, tx, remote_addr, &message).await,
        _ if !conn.is_authenticated => {
            send_frame(tx, &Message::error(403, "Not authenticated", "")).await
        }
        MessageType::SnapshotRequest => handle_snapshot_request(state, conn, tx, &message).await,
        MessageType::StateUpdate => handle_state_update(state, conn, tx, &message).await,
        MessageType::DeviceList => handle_device_list(state, conn, tx).await,
        _ => {
            warn!(
                target: "ws",
                connection_id = %conn.connection_id,
                message_type = kind.name(),
                "unexpected inbound message type, ignoring"
            );
            true
        }
    }
}

async fn handle_heartbeat(
    state: &WsState,
    conn: &mut ConnectionState,
    tx: &OutboundSender,
    message: &Message,
) -> bool {
    conn.last_ping = Utc::now();

    if conn.is_authenticated && !conn.device_id.is_empty() {
        if let Err(err) = state.store.update_device_presence(&conn.device_id).await {
            warn!(
                target: "ws",
                device_id = %conn.device_id,
                error = %err,
                "failed to refresh device presence"
            );
        }
    }

    let ack = Message::build(
        MessageType::HeartbeatAck,
        json!({
            "server_time": Utc::now().timestamp(),
            "client_time": message.payload.get("client_time").cloned().unwrap_or(Value::Null),
        }),
    );
    send_frame(tx, &ack).await
}

async fn handle_auth(
    state: &WsState,
    conn: &mut ConnectionState,
    tx: &OutboundSender,
    remote_addr: SocketAddr,
    message: &Message,
) -> bool {
    let Some(token) = message.payload_str("token") else {
        return send_frame(tx, &Message::error(401, "Missing token", "")).await;
    };

    let claims = match state.authority.validate(token) {
        Ok(claims) => claims,
        Err(AuthError::TokenExpired(_)) => {
            return send_frame(tx, &Message::error(401, "Token expired", "")).await;
        }
        Err(_) => {
            return send_frame(tx, &Message::error(401, "Invalid token", "")).await;
        }
    };

    let device_type = message.payload_str("device_type").unwrap_or_default();
    let device_name = message.payload_str("device_name").unwrap_or_default();
    // Admin status comes from the validated claims, never from the frame.
    let is_admin = crate::auth::is_admin(&claims.roles);

    conn.user_id = claims.user_id.clone();
    conn.session_id = claims.session_id.clone();
    conn.device_id = claims.device_id.clone();
    conn.is_authenticated = true;

    state.hub.authenticate(
        conn.connection_id.clone(),
        ConnectionIdentity {
            user_id: claims.user_id.clone(),
            session_id: claims.session_id.clone(),
            device_id: claims.device_id.clone(),
            device_type: device_type.to_string(),
            device_name: device_name.to_string(),
            is_admin,
        },
    );

    let device = DeviceInfo {
        device_id: claims.device_id.clone(),
        device_type: device_type.to_string(),
        device_name: device_name.to_string(),
        app_version: String::new(),
        os_version: String::new(),
        connected_at: conn.connected_at,
        last_seen: Utc::now(),
        is_online: true,
        session_id: claims.session_id.clone(),
        user_id: claims.user_id.clone(),
        metadata: None,
        ip_address: remote_addr.ip().to_string(),
        connection_id: conn.connection_id.clone(),
    };
    if let Err(err) = state.store.register_device(&device).await {
        warn!(target: "ws", error = %err, "failed to register device");
    }

    // Push the latest snapshot so the device resumes where its siblings
    // left off.
    match state.store.get_snapshot(&claims.session_id).await {
        Ok(Some(snapshot)) => {
            let response = Message::build(
                MessageType::SnapshotResponse,
                json!({
                    "session_id": snapshot.session_id,
                    "state_data": snapshot.state_data,
                    "restored": true,
                    "version": snapshot.version,
                }),
            );
            if !send_frame(tx, &response).await {
                return false;
            }
        }
        Ok(None) => {}
        Err(err) => {
            warn!(target: "ws", error = %err, "failed to load snapshot during auth");
        }
    }

    let new_token = match state.authority.refresh(token) {
        Ok((token, _)) => token,
        Err(err) => {
            warn!(target: "ws", error = %err, "failed to refresh token");
            String::new()
        }
    };

    let success = Message::build(
        MessageType::AuthSuccess,
        json!({
            "new_token": new_token,
            "expires_at": claims.exp,
            "device_id": claims.device_id,
            "session_id": claims.session_id,
        }),
    );
    if !send_frame(tx, &success).await {
        return false;
    }

    info!(
        target: "ws",
        connection_id = %conn.connection_id,
        user_id = %claims.user_id,
        session_id = %claims.session_id,
        device_id = %claims.device_id,
        "connection authenticated"
    );
    true
}

async fn handle_snapshot_request(
    state: &WsState,
    conn: &mut ConnectionState,
    tx: &OutboundSender,
    message: &Message,
) -> bool {
    let session_id = match message.payload_str("session_id") {
        Some(sid) if !sid.is_empty() => sid.to_string(),
        _ => conn.session_id.clone(),
    };

    let snapshot = match state.store.get_snapshot(&session_id).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(target: "ws", error = %err, "failed to get snapshot");
            return send_frame(tx, &Message::error(500, "Failed to retrieve snapshot", "")).await;
        }
    };

    let response = match snapshot {
        Some(snapshot) => Message::build(
            MessageType::SnapshotResponse,
            json!({
                "session_id": snapshot.session_id,
                "state_data": snapshot.state_data,
                "created_at": snapshot.created_at.timestamp(),
                "version": snapshot.version,
            }),
        ),
        None => Message::build(
            MessageType::SnapshotResponse,
            json!({
                "session_id": session_id,
                "state_data": {},
                "created_at": Value::Null,
                "version": 0,
            }),
        ),
    };
    send_frame(tx, &response).await
}

async fn handle_state_update(
    state: &WsState,
    conn: &mut ConnectionState,
    tx: &OutboundSender,
    message: &Message,
) -> bool {
    let mut snapshot = match state.store.get_snapshot(&conn.session_id).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => SessionSnapshot::empty(&conn.session_id, &conn.user_id, &conn.device_id),
        Err(err) => {
            warn!(target: "ws", error = %err, "failed to get snapshot for update");
            return send_frame(tx, &Message::error(500, "Failed to retrieve snapshot", "")).await;
        }
    };

    if let Some(key) = message.payload_str("key").map(|k| k.to_string()) {
        if let Some(value) = message.payload.get("value") {
            snapshot.state_data.insert(key, value.clone());
        } else if message.payload_str("operation") == Some("DELETE") {
            snapshot.state_data.remove(&key);
        }
    }
    snapshot.touch();

    if let Err(err) = state.store.save_snapshot(&mut snapshot).await {
        warn!(target: "ws", error = %err, "failed to save snapshot");
        return send_frame(tx, &Message::error(500, "Failed to save snapshot", "")).await;
    }

    // Echo suppression: the sender is excluded unless it explicitly asked
    // to see its own update on every device.
    let exclude = if message.payload_bool("sync_devices") == Some(true) {
        String::new()
    } else {
        conn.connection_id.clone()
    };

    let mut broadcast = Message::build(
        MessageType::StateUpdate,
        json!({
            "key": message.payload.get("key").cloned().unwrap_or(Value::Null),
            "value": message.payload.get("value").cloned().unwrap_or(Value::Null),
            "operation": message.payload.get("operation").cloned().unwrap_or(Value::Null),
            "exclude_connection": exclude,
            "version": snapshot.version,
        }),
    );
    broadcast.user_id = conn.user_id.clone();
    broadcast.session_id = conn.session_id.clone();
    broadcast.device_id = conn.device_id.clone();
    state.hub.broadcast(broadcast);
    true
}

async fn handle_device_list(
    state: &WsState,
    conn: &mut ConnectionState,
    tx: &OutboundSender,
) -> bool {
    let mut devices = match state.store.get_user_devices(&conn.user_id).await {
        Ok(devices) => devices,
        Err(err) => {
            warn!(target: "ws", error = %err, "failed to get user devices");
            return send_frame(tx, &Message::error(500, "Failed to retrieve devices", "")).await;
        }
    };

    for device in &mut devices {
        if state.hub.is_device_online(&device.device_id) {
            device.is_online = true;
        }
    }

    let count = devices.len();
    let response = Message::build(
        MessageType::DeviceList,
        json!({
            "devices": devices,
            "count": count,
        }),
    );
    send_frame(tx, &response).await
}

/// Queue a direct reply on this connection's own outbound queue. Waits for
/// space (only this connection's pump is behind it); a closed queue means
/// the connection is going away.
async fn send_frame(tx: &OutboundSender, message: &Message) -> bool {
    let frame: OutboundFrame = Arc::from(message.to_wire());
    tx.send(frame).await.is_ok()
}

/// Write pump: drains the outbound queue onto the transport. Pending frames
/// are batched into a single text write separated by newlines, in enqueue
/// order. A missed write deadline closes the connection.
async fn write_pump(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<OutboundFrame>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(frame) = maybe else {
                    // Queue closed by the hub: say goodbye and stop.
                    let _ = timeout(WRITE_WAIT, sink.send(WsMessage::Close(None))).await;
                    return;
                };
                let mut batch = frame.to_string();
                while let Ok(next) = rx.try_recv() {
                    batch.push('\n');
                    batch.push_str(&next);
                }
                match timeout(WRITE_WAIT, sink.send(WsMessage::Text(batch))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
            _ = ping.tick() => {
                match timeout(WRITE_WAIT, sink.send(WsMessage::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}
