//! Session snapshot handlers: create/read, incremental updates, conflict
//! resolution, and the liveness probe.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::store::{
    ConflictInfo, HealthStatus, IncrementalUpdate, SessionSnapshot, SNAPSHOT_TTL, STATUS_DEGRADED,
    STATUS_HEALTHY, STATUS_UNHEALTHY,
};

use super::AppState;

#[derive(Debug, Deserialize)]
struct CreateSnapshotRequest {
    session_id: String,
    user_id: String,
    state_data: HashMap<String, Value>,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    app_version: String,
    #[serde(default)]
    version: i64,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    session_id: String,
    user_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    device_id: String,
    app_version: String,
    version: i64,
}

#[derive(Debug, Deserialize)]
struct IncrementalUpdateRequest {
    session_id: String,
    user_id: String,
    device_id: String,
    #[serde(default)]
    base_version: i64,
    #[serde(default)]
    changes: HashMap<String, Value>,
    #[serde(default)]
    deleted_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConflictResolutionRequest {
    session_id: String,
    #[serde(default)]
    client_version: i64,
    #[serde(default)]
    client_state: HashMap<String, Value>,
    #[serde(default)]
    resolution_strategy: String,
}

#[derive(Debug, Deserialize)]
pub struct GetSnapshotQuery {
    #[serde(default)]
    version: Option<i64>,
}

/// POST /session/snapshot
pub async fn create_snapshot(State(state): State<AppState>, body: Bytes) -> Response {
    let req: CreateSnapshotRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(response) => return response,
    };
    if req.session_id.is_empty() || req.user_id.is_empty() {
        return bad_request("session_id and user_id are required");
    }

    let now = Utc::now();
    let mut snapshot = SessionSnapshot {
        session_id: req.session_id,
        user_id: req.user_id,
        state_data: req.state_data,
        created_at: now,
        expires_at: now + SNAPSHOT_TTL,
        device_id: req.device_id,
        app_version: req.app_version,
        last_updated: now,
        version: req.version,
        checksum: String::new(),
        compressed: false,
    };

    if let Err(err) = state.store.save_snapshot(&mut snapshot).await {
        error!(target: "http", session_id = %snapshot.session_id, error = %err, "failed to save snapshot");
        return internal_error("Failed to save snapshot");
    }

    info!(
        target: "http",
        session_id = %snapshot.session_id,
        user_id = %snapshot.user_id,
        version = snapshot.version,
        "snapshot created"
    );

    (
        StatusCode::CREATED,
        Json(SnapshotResponse {
            session_id: snapshot.session_id,
            user_id: snapshot.user_id,
            created_at: snapshot.created_at,
            expires_at: snapshot.expires_at,
            device_id: snapshot.device_id,
            app_version: snapshot.app_version,
            version: snapshot.version,
        }),
    )
        .into_response()
}

/// GET /session/:uuid
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<GetSnapshotQuery>,
) -> Response {
    if session_id.is_empty() {
        return bad_request("session ID is required");
    }

    let result = match query.version {
        Some(version) if version > 0 => {
            state
                .store
                .get_snapshot_with_version(&session_id, version)
                .await
        }
        _ => state.store.get_snapshot(&session_id).await,
    };

    let snapshot = match result {
        Ok(snapshot) => snapshot,
        Err(err) => {
            error!(target: "http", session_id, error = %err, "failed to get snapshot");
            return internal_error("Failed to retrieve snapshot");
        }
    };

    let Some(snapshot) = snapshot else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Snapshot not found"})),
        )
            .into_response();
    };

    debug!(
        target: "http",
        session_id,
        version = snapshot.version,
        "snapshot retrieved"
    );
    Json(snapshot).into_response()
}

/// POST /session/incremental
pub async fn apply_incremental_update(State(state): State<AppState>, body: Bytes) -> Response {
    let req: IncrementalUpdateRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(response) => return response,
    };
    if req.session_id.is_empty() || req.user_id.is_empty() || req.device_id.is_empty() {
        return bad_request("session_id, user_id and device_id are required");
    }

    let update = IncrementalUpdate {
        session_id: req.session_id.clone(),
        user_id: req.user_id,
        device_id: req.device_id.clone(),
        base_version: req.base_version,
        changes: req.changes,
        deleted_keys: req.deleted_keys,
        timestamp: Utc::now(),
    };

    if let Err(err) = state.store.apply_incremental_update(&update).await {
        error!(target: "http", session_id = %update.session_id, error = %err, "failed to apply incremental update");
        return internal_error("Failed to apply update");
    }

    info!(
        target: "http",
        session_id = %update.session_id,
        device_id = %update.device_id,
        "incremental update applied"
    );

    Json(json!({
        "message": "Update applied successfully",
        "session_id": req.session_id,
    }))
    .into_response()
}

/// POST /session/conflict/resolve
pub async fn resolve_conflict(State(state): State<AppState>, body: Bytes) -> Response {
    let req: ConflictResolutionRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(response) => return response,
    };
    if req.session_id.is_empty() {
        return bad_request("session_id is required");
    }

    let server_snapshot = match state.store.get_snapshot(&req.session_id).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "Session not found"})),
            )
                .into_response();
        }
        Err(err) => {
            error!(target: "http", session_id = %req.session_id, error = %err, "failed to get snapshot for conflict resolution");
            return internal_error("Failed to retrieve server state");
        }
    };

    let conflicting_keys =
        find_conflicting_keys(&server_snapshot.state_data, &req.client_state);
    let resolved = resolve_state(
        &server_snapshot.state_data,
        &req.client_state,
        &req.resolution_strategy,
    );

    let mut merged = server_snapshot.clone();
    merged.state_data = resolved;
    merged.touch();

    if let Err(err) = state.store.save_snapshot(&mut merged).await {
        error!(target: "http", session_id = %req.session_id, error = %err, "failed to save resolved snapshot");
        return internal_error("Failed to save resolved state");
    }

    info!(
        target: "http",
        session_id = %req.session_id,
        strategy = %req.resolution_strategy,
        new_version = merged.version,
        "conflict resolved"
    );

    Json(ConflictInfo {
        session_id: req.session_id,
        server_version: merged.version,
        client_version: req.client_version,
        server_state: merged.state_data,
        client_state: req.client_state,
        conflicting_keys,
        timestamp: Utc::now(),
    })
    .into_response()
}

/// Merge laws:
/// - `client_wins`: client overwrites the overlap
/// - `server_wins`: server overwrites the overlap
/// - `merge`: server kept, client added only where server has no key
/// - anything else: server state unchanged
fn resolve_state(
    server_state: &HashMap<String, Value>,
    client_state: &HashMap<String, Value>,
    strategy: &str,
) -> HashMap<String, Value> {
    match strategy {
        "client_wins" => {
            let mut resolved = server_state.clone();
            for (key, value) in client_state {
                resolved.insert(key.clone(), value.clone());
            }
            resolved
        }
        "server_wins" => {
            let mut resolved = client_state.clone();
            for (key, value) in server_state {
                resolved.insert(key.clone(), value.clone());
            }
            resolved
        }
        "merge" => {
            let mut resolved = server_state.clone();
            for (key, value) in client_state {
                resolved.entry(key.clone()).or_insert_with(|| value.clone());
            }
            resolved
        }
        _ => server_state.clone(),
    }
}

/// Keys present on both sides with differing values.
fn find_conflicting_keys(
    server_state: &HashMap<String, Value>,
    client_state: &HashMap<String, Value>,
) -> Vec<String> {
    let mut conflicts: Vec<String> = client_state
        .iter()
        .filter(|(key, client_value)| {
            server_state
                .get(*key)
                .map(|server_value| server_value != *client_value)
                .unwrap_or(false)
        })
        .map(|(key, _)| key.clone())
        .collect();
    conflicts.sort();
    conflicts
}

/// GET /health
///
/// A failing backend probe degrades the service but still answers 200 —
/// the hub keeps fanning out from memory. Only `unhealthy` maps to 503.
pub async fn health_check(State(state): State<AppState>) -> Response {
    let mut metrics: HashMap<String, Value> = HashMap::new();
    metrics.insert(
        "snapshot_ttl_hours".into(),
        json!(SNAPSHOT_TTL.as_secs_f64() / 3600.0),
    );
    metrics.insert("multi_device_enabled".into(), json!(true));
    metrics.insert("versioning_enabled".into(), json!(true));

    let mut status = HealthStatus {
        status: STATUS_HEALTHY,
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        connections: state.hub.connection_count(),
        metrics,
    };

    if let Err(err) = state.store.health_check().await {
        status.status = STATUS_DEGRADED;
        status.metrics.insert("store_reachable".into(), json!(false));
        error!(target: "http", error = %err, "store health check failed");
    }

    let code = if status.status == STATUS_UNHEALTHY {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status)).into_response()
}

pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": err.to_string()})),
        )
            .into_response()
    })
}

pub(crate) fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

pub(crate) fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": message})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_server_wins_keeps_server_overlap() {
        let server = state(&[("counter", json!(10)), ("status", json!("active"))]);
        let client = state(&[("counter", json!(15)), ("new_field", json!("test"))]);
        let resolved = resolve_state(&server, &client, "server_wins");
        assert_eq!(resolved["counter"], json!(10));
        assert_eq!(resolved["status"], json!("active"));
        assert_eq!(resolved["new_field"], json!("test"));
    }

    #[test]
    fn test_client_wins_keeps_client_overlap() {
        let server = state(&[("counter", json!(10)), ("status", json!("active"))]);
        let client = state(&[("counter", json!(15)), ("new_field", json!("test"))]);
        let resolved = resolve_state(&server, &client, "client_wins");
        assert_eq!(resolved["counter"], json!(15));
        assert_eq!(resolved["status"], json!("active"));
        assert_eq!(resolved["new_field"], json!("test"));
    }

    #[test]
    fn test_merge_adds_only_missing_keys() {
        let server = state(&[("counter", json!(10))]);
        let client = state(&[("counter", json!(15)), ("extra", json!(1))]);
        let resolved = resolve_state(&server, &client, "merge");
        assert_eq!(resolved["counter"], json!(10));
        assert_eq!(resolved["extra"], json!(1));
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_unknown_strategy_returns_server_state() {
        let server = state(&[("counter", json!(10))]);
        let client = state(&[("counter", json!(15)), ("extra", json!(1))]);
        let resolved = resolve_state(&server, &client, "coin_flip");
        assert_eq!(resolved, server);
    }

    #[test]
    fn test_conflicting_keys_are_overlapping_diffs() {
        let server = state(&[
            ("counter", json!(10)),
            ("status", json!("active")),
            ("same", json!(1)),
        ]);
        let client = state(&[
            ("counter", json!(15)),
            ("same", json!(1)),
            ("client_only", json!("x")),
        ]);
        let conflicts = find_conflicting_keys(&server, &client);
        assert_eq!(conflicts, vec!["counter".to_string()]);
    }

    #[test]
    fn test_nested_values_compare_structurally() {
        let server = state(&[("prefs", json!({"theme": "dark"}))]);
        let client = state(&[("prefs", json!({"theme": "dark"}))]);
        assert!(find_conflicting_keys(&server, &client).is_empty());

        let client = state(&[("prefs", json!({"theme": "light"}))]);
        assert_eq!(
            find_conflicting_keys(&server, &client),
            vec!["prefs".to_string()]
        );
    }
}
