//! Admin handlers: aggregate metrics, active session/connection listings,
//! and the admin broadcast. Everything here sits behind the admin gate and
//! may run O(N) store scans.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::hub::HubSnapshot;
use crate::protocol::{Message, MessageType};
use crate::store::{AdminMetrics, ConnectionMetrics, SessionMetrics, SnapshotMetrics};

use super::session::{internal_error, parse_body};
use super::AppState;

/// GET /admin/metrics/sessions
pub async fn get_session_metrics(State(state): State<AppState>) -> Response {
    let mut metrics = match state.store.get_session_metrics().await {
        Ok(metrics) => metrics,
        Err(err) => {
            error!(target: "http", error = %err, "failed to get session metrics");
            return internal_error("Failed to retrieve session metrics");
        }
    };
    metrics.active_sessions = metrics.sessions_by_device.values().sum();
    Json(metrics).into_response()
}

/// GET /admin/metrics/connections
pub async fn get_connection_metrics(State(state): State<AppState>) -> Response {
    Json(connection_metrics(&state.hub.snapshot())).into_response()
}

/// GET /admin/metrics/snapshots
pub async fn get_snapshot_metrics(State(state): State<AppState>) -> Response {
    match state.store.get_snapshot_metrics().await {
        Ok(metrics) => Json(metrics).into_response(),
        Err(err) => {
            error!(target: "http", error = %err, "failed to get snapshot metrics");
            internal_error("Failed to retrieve snapshot metrics")
        }
    }
}

/// GET /admin/metrics/all
pub async fn get_all_metrics(State(state): State<AppState>) -> Response {
    let sessions = match state.store.get_session_metrics().await {
        Ok(mut metrics) => {
            metrics.active_sessions = metrics.sessions_by_device.values().sum();
            metrics
        }
        Err(err) => {
            error!(target: "http", error = %err, "failed to get session metrics");
            SessionMetrics {
                timestamp: Utc::now(),
                ..SessionMetrics::default()
            }
        }
    };

    let snapshots = match state.store.get_snapshot_metrics().await {
        Ok(metrics) => metrics,
        Err(err) => {
            error!(target: "http", error = %err, "failed to get snapshot metrics");
            SnapshotMetrics {
                timestamp: Utc::now(),
                ..SnapshotMetrics::default()
            }
        }
    };

    Json(AdminMetrics {
        sessions,
        connections: connection_metrics(&state.hub.snapshot()),
        snapshots,
        timestamp: Utc::now(),
    })
    .into_response()
}

/// GET /admin/sessions
pub async fn get_active_sessions(State(state): State<AppState>) -> Response {
    let session_ids = match state.store.get_all_session_ids().await {
        Ok(ids) => ids,
        Err(err) => {
            error!(target: "http", error = %err, "failed to get session ids");
            return internal_error("Failed to retrieve sessions");
        }
    };

    let mut sessions = Vec::with_capacity(session_ids.len());
    for session_id in session_ids {
        match state.store.get_snapshot(&session_id).await {
            Ok(Some(snapshot)) => sessions.push(json!({
                "session_id": snapshot.session_id,
                "user_id": snapshot.user_id,
                "device_id": snapshot.device_id,
                "last_updated": snapshot.last_updated,
                "version": snapshot.version,
            })),
            Ok(None) => {}
            Err(_) => continue,
        }
    }

    let count = sessions.len();
    Json(json!({
        "sessions": sessions,
        "count": count,
    }))
    .into_response()
}

/// GET /admin/connections
pub async fn get_active_connections(State(state): State<AppState>) -> Response {
    let snapshot = state.hub.snapshot();
    Json(json!({
        "total_connections": snapshot.total,
        "connected_devices": snapshot.devices_by_user,
        "unique_users": snapshot.devices_by_user.len(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct AdminBroadcastRequest {
    message: String,
    #[serde(default, rename = "type")]
    kind: String,
}

/// POST /admin/broadcast
pub async fn broadcast_admin_message(State(state): State<AppState>, body: Bytes) -> Response {
    let req: AdminBroadcastRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(response) => return response,
    };
    if req.message.is_empty() {
        return super::session::bad_request("message is required");
    }

    state.hub.admin_broadcast(Message::build(
        MessageType::AdminUpdate,
        json!({
            "message": req.message,
            "type": req.kind,
            "sent_at": Utc::now().timestamp(),
        }),
    ));

    info!(target: "http", kind = %req.kind, "admin message broadcast");

    Json(json!({
        "message": "Broadcast sent successfully",
        "type": req.kind,
    }))
    .into_response()
}

fn connection_metrics(snapshot: &HubSnapshot) -> ConnectionMetrics {
    let connections_by_user: HashMap<String, i64> = snapshot
        .devices_by_user
        .iter()
        .map(|(user_id, devices)| (user_id.clone(), devices.len() as i64))
        .collect();

    ConnectionMetrics {
        total_connections: snapshot.total,
        active_connections: snapshot.total,
        authenticated_conns: snapshot.authenticated,
        connections_by_user,
        peak_connections: snapshot.peak,
        messages_sent: snapshot.messages_sent,
        messages_received: snapshot.messages_received,
        timestamp: Utc::now(),
    }
}
