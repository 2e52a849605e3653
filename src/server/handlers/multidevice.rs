//! Multi-device handlers: device listing, session handoff, and remote
//! device disconnect.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::protocol::{Message, MessageType};
use crate::store::{DeviceInfo, HandoffToken, HANDOFF_TOKEN_TTL};

use super::session::{bad_request, internal_error, parse_body};
use super::AppState;

#[derive(Debug, Deserialize)]
struct HandoffRequest {
    source_device: String,
    target_device: String,
}

#[derive(Debug, Serialize)]
struct HandoffResponse {
    token: String,
    session_id: String,
    source_device: String,
    target_device: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct DeviceListResponse {
    session_id: String,
    devices: Vec<DeviceInfo>,
    count: usize,
}

/// GET /session/:uuid/devices
pub async fn get_session_devices(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    if session_id.is_empty() {
        return bad_request("session ID is required");
    }

    let mut devices = match state.store.get_session_devices(&session_id).await {
        Ok(devices) => devices,
        Err(err) => {
            error!(target: "http", session_id, error = %err, "failed to get session devices");
            return internal_error("Failed to retrieve devices");
        }
    };

    for device in &mut devices {
        if state.hub.is_device_online(&device.device_id) {
            device.is_online = true;
        }
    }

    let count = devices.len();
    Json(DeviceListResponse {
        session_id,
        devices,
        count,
    })
    .into_response()
}

/// POST /session/:uuid/handoff
pub async fn initiate_handoff(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Response {
    if session_id.is_empty() {
        return bad_request("session ID is required");
    }
    let req: HandoffRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(response) => return response,
    };
    if req.source_device.is_empty() || req.target_device.is_empty() {
        return bad_request("source_device and target_device are required");
    }

    let snapshot = match state.store.get_snapshot(&session_id).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Session not found"})),
            )
                .into_response();
        }
        Err(err) => {
            error!(target: "http", session_id, error = %err, "failed to get snapshot for handoff");
            return internal_error("Failed to retrieve session");
        }
    };

    let token = generate_handoff_token();
    let now = Utc::now();
    let handoff = HandoffToken {
        token: token.clone(),
        session_id: session_id.clone(),
        source_device: req.source_device.clone(),
        target_device: req.target_device.clone(),
        user_id: snapshot.user_id.clone(),
        created_at: now,
        expires_at: now + HANDOFF_TOKEN_TTL,
        state_data: snapshot.state_data,
    };

    if let Err(err) = state.store.save_handoff_token(&handoff).await {
        error!(target: "http", session_id, error = %err, "failed to save handoff token");
        return internal_error("Failed to create handoff token");
    }

    // Let the user's other devices know a handoff is underway.
    let mut notice = Message::build(
        MessageType::Broadcast,
        json!({
            "event": "handoff_initiated",
            "source_device": req.source_device,
            "target_device": req.target_device,
            "session_id": session_id,
        }),
    );
    notice.user_id = snapshot.user_id;
    notice.session_id = session_id.clone();
    state.hub.broadcast(notice);

    info!(
        target: "http",
        session_id,
        source_device = %req.source_device,
        target_device = %req.target_device,
        "handoff initiated"
    );

    (
        StatusCode::CREATED,
        Json(HandoffResponse {
            token,
            session_id,
            source_device: req.source_device,
            target_device: req.target_device,
            expires_at: handoff.expires_at,
        }),
    )
        .into_response()
}

/// GET /session/:uuid/handoff/:token
///
/// One-shot: a successful validation deletes the record, so the second
/// caller sees 404. An expired-but-present record is 410, distinguishing
/// lifetime exhaustion from never-existed.
pub async fn validate_handoff_token(
    State(state): State<AppState>,
    Path((session_id, token)): Path<(String, String)>,
) -> Response {
    if session_id.is_empty() || token.is_empty() {
        return bad_request("session ID and token are required");
    }

    let handoff = match state.store.get_handoff_token(&token).await {
        Ok(handoff) => handoff,
        Err(err) => {
            error!(target: "http", session_id, error = %err, "failed to get handoff token");
            return internal_error("Failed to validate token");
        }
    };

    let Some(handoff) = handoff else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Handoff token not found or expired"})),
        )
            .into_response();
    };

    if handoff.session_id != session_id {
        return bad_request("Token does not match session");
    }

    if handoff.is_expired() {
        let _ = state.store.delete_handoff_token(&token).await;
        return (
            StatusCode::GONE,
            Json(json!({"error": "Handoff token has expired"})),
        )
            .into_response();
    }

    if let Err(err) = state.store.delete_handoff_token(&token).await {
        error!(target: "http", session_id, error = %err, "failed to consume handoff token");
        return internal_error("Failed to validate token");
    }

    info!(target: "http", session_id, "handoff token validated");

    Json(json!({
        "valid": true,
        "session_id": handoff.session_id,
        "source_device": handoff.source_device,
        "target_device": handoff.target_device,
        "state_data": handoff.state_data,
    }))
    .into_response()
}

/// DELETE /session/:uuid/device/:device_id
pub async fn disconnect_device(
    State(state): State<AppState>,
    Path((session_id, device_id)): Path<(String, String)>,
) -> Response {
    if session_id.is_empty() || device_id.is_empty() {
        return bad_request("session ID and device ID are required");
    }

    let snapshot = match state.store.get_snapshot(&session_id).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Session not found"})),
            )
                .into_response();
        }
        Err(err) => {
            error!(target: "http", session_id, error = %err, "failed to get snapshot");
            return internal_error("Failed to retrieve session");
        }
    };

    if let Err(err) = state
        .store
        .remove_device(&device_id, &snapshot.user_id, &session_id)
        .await
    {
        error!(target: "http", device_id, error = %err, "failed to remove device");
        return internal_error("Failed to remove device");
    }

    state.hub.disconnect_device(device_id.clone());

    let mut notice = Message::build(
        MessageType::DeviceLeft,
        json!({
            "event": "device_disconnected",
            "device_id": device_id,
            "session_id": session_id,
            "disconnected_at": Utc::now().timestamp(),
        }),
    );
    notice.user_id = snapshot.user_id;
    notice.session_id = session_id.clone();
    notice.device_id = device_id.clone();
    state.hub.broadcast(notice);

    info!(target: "http", device_id, session_id, "device disconnected");

    Json(json!({
        "message": "Device disconnected successfully",
        "device_id": device_id,
        "session_id": session_id,
    }))
    .into_response()
}

/// 256-bit random pairing token, hex-encoded.
fn generate_handoff_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handoff_token_shape() {
        let token = generate_handoff_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_handoff_tokens_are_unique() {
        assert_ne!(generate_handoff_token(), generate_handoff_token());
    }
}
