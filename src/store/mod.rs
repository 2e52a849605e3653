//! Persistent state model
//!
//! Types stored in the key-value backend: session snapshots, device
//! registrations, handoff tokens, and the aggregate metrics views served
//! from admin paths. The Redis-backed gateway lives in [`redis`].

pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::redis::{StateStore, StoreConfig};

/// Authoritative snapshot lifetime.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Device presence lifetime; refreshed on every heartbeat.
pub const DEVICE_PRESENCE_TTL: Duration = Duration::from_secs(2 * 60);

/// Handoff pairing token lifetime.
pub const HANDOFF_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// Error types for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(#[from] ::redis::RedisError),
    #[error("corrupt record at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The authoritative per-session state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub state_data: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub device_id: String,
    #[serde(default)]
    pub app_version: String,
    pub last_updated: DateTime<Utc>,
    /// Monotone revision token: wall-clock nanoseconds at write time.
    pub version: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default)]
    pub compressed: bool,
}

impl SessionSnapshot {
    /// Create an empty snapshot for a session that has no persisted state
    /// yet. Used when an incremental update or state-update frame arrives
    /// before any full snapshot was saved.
    pub fn empty(session_id: &str, user_id: &str, device_id: &str) -> SessionSnapshot {
        let now = Utc::now();
        SessionSnapshot {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            state_data: HashMap::new(),
            created_at: now,
            expires_at: now + SNAPSHOT_TTL,
            device_id: device_id.to_string(),
            app_version: String::new(),
            last_updated: now,
            version: 0,
            checksum: String::new(),
            compressed: false,
        }
    }

    /// A snapshot past its expiry is treated as absent even if a derived
    /// index still names it.
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    /// Stamp a fresh revision: version becomes current wall-clock nanos,
    /// last_updated is now, expiry slides 7 days forward.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.version = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.last_updated = now;
        self.expires_at = now + SNAPSHOT_TTL;
    }
}

/// Registration record for a (device, session, user) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: String,
    pub device_name: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub os_version: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_online: bool,
    pub session_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connection_id: String,
}

/// Single-use pairing artifact carrying the session state to a new device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffToken {
    pub token: String,
    pub session_id: String,
    pub source_device: String,
    pub target_device: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state_data: HashMap<String, Value>,
}

impl HandoffToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// A diff applied against the current snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalUpdate {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    #[serde(default)]
    pub base_version: i64,
    #[serde(default)]
    pub changes: HashMap<String, Value>,
    #[serde(default)]
    pub deleted_keys: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Result of a conflict resolution: both sides, the merged outcome's
/// version, and the keys whose values differed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub session_id: String,
    pub server_version: i64,
    pub client_version: i64,
    pub server_state: HashMap<String, Value>,
    pub client_state: HashMap<String, Value>,
    pub conflicting_keys: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub expired_sessions: i64,
    #[serde(rename = "average_session_ttl_hours")]
    pub average_session_ttl: f64,
    pub sessions_by_device: HashMap<String, i64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        SessionMetrics {
            total_sessions: 0,
            active_sessions: 0,
            expired_sessions: 0,
            average_session_ttl: 0.0,
            sessions_by_device: HashMap::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub total_connections: i64,
    pub active_connections: i64,
    #[serde(rename = "authenticated_connections")]
    pub authenticated_conns: i64,
    pub connections_by_user: HashMap<String, i64>,
    pub peak_connections: i64,
    pub messages_sent: i64,
    pub messages_received: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetrics {
    pub total_snapshots: i64,
    #[serde(rename = "total_size_bytes")]
    pub total_size: i64,
    #[serde(rename = "average_size_bytes")]
    pub average_size: f64,
    pub compressed_snapshots: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_snapshot: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_snapshot: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Default for SnapshotMetrics {
    fn default() -> Self {
        SnapshotMetrics {
            total_snapshots: 0,
            total_size: 0,
            average_size: 0.0,
            compressed_snapshots: 0,
            oldest_snapshot: None,
            newest_snapshot: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminMetrics {
    pub sessions: SessionMetrics,
    pub connections: ConnectionMetrics,
    pub snapshots: SnapshotMetrics,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub uptime_secs: u64,
    #[serde(rename = "active_connections")]
    pub connections: i64,
    pub metrics: HashMap<String, Value>,
}

pub const STATUS_HEALTHY: &str = "healthy";
pub const STATUS_DEGRADED: &str = "degraded";
pub const STATUS_UNHEALTHY: &str = "unhealthy";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_snapshot_defaults() {
        let snap = SessionSnapshot::empty("s1", "u1", "d1");
        assert_eq!(snap.version, 0);
        assert!(snap.state_data.is_empty());
        assert!(!snap.is_expired());
        assert_eq!(
            (snap.expires_at - snap.last_updated).num_seconds(),
            SNAPSHOT_TTL.as_secs() as i64
        );
    }

    #[test]
    fn test_touch_advances_version() {
        let mut snap = SessionSnapshot::empty("s1", "u1", "d1");
        snap.touch();
        let first = snap.version;
        assert!(first > 0);
        snap.touch();
        assert!(snap.version >= first);
    }

    #[test]
    fn test_expired_snapshot_detected() {
        let mut snap = SessionSnapshot::empty("s1", "u1", "d1");
        snap.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(snap.is_expired());
    }

    #[test]
    fn test_snapshot_wire_format() {
        let mut snap = SessionSnapshot::empty("s1", "u1", "d1");
        snap.state_data.insert("progress".into(), json!(50));
        let wire = serde_json::to_value(&snap).unwrap();
        assert_eq!(wire["session_id"], "s1");
        assert_eq!(wire["state_data"]["progress"], 50);
        // checksum omitted while empty
        assert!(wire.get("checksum").is_none());
    }

    #[test]
    fn test_handoff_expiry() {
        let now = Utc::now();
        let token = HandoffToken {
            token: "t".into(),
            session_id: "s1".into(),
            source_device: "phone".into(),
            target_device: "laptop".into(),
            user_id: "u1".into(),
            created_at: now,
            expires_at: now - chrono::Duration::seconds(1),
            state_data: HashMap::new(),
        };
        assert!(token.is_expired());
    }
}
