//! Redis-backed state store gateway.
//!
//! Owns the key layout and TTL policy for snapshots, device registrations,
//! handoff tokens, and middleware counters. Multi-key writes go through
//! atomic pipelines; the snapshot key is the source of truth and the
//! membership sets are derived.
//!
//! The O(N) scans (`session_metrics`, `snapshot_metrics`, `all_session_ids`)
//! are admin-path only and must never be called from hot paths.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{
    DeviceInfo, HandoffToken, IncrementalUpdate, SessionMetrics, SessionSnapshot, SnapshotMetrics,
    StoreError, DEVICE_PRESENCE_TTL, HANDOFF_TOKEN_TTL, SNAPSHOT_TTL,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for the backing store.
#[derive(Clone)]
pub struct StoreConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
}

// The password never appears in Debug output.
impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("addr", &self.addr)
            .field("db", &self.db)
            .field("has_password", &!self.password.is_empty())
            .finish()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            addr: "localhost:6379".to_string(),
            password: String::new(),
            db: 0,
        }
    }
}

impl StoreConfig {
    fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.addr, self.db)
        }
    }
}

/// Async gateway to the TTL-capable key-value backend.
///
/// Cheap to clone; all methods take `&self`.
#[derive(Clone)]
pub struct StateStore {
    conn: ConnectionManager,
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn session_metadata_key(session_id: &str) -> String {
    format!("session:{session_id}:metadata")
}

fn user_sessions_key(user_id: &str) -> String {
    format!("user:{user_id}:sessions")
}

fn device_key(device_id: &str) -> String {
    format!("device:{device_id}")
}

fn user_devices_key(user_id: &str) -> String {
    format!("user:{user_id}:devices")
}

fn session_devices_key(session_id: &str) -> String {
    format!("session:{session_id}:devices")
}

fn handoff_key(token: &str) -> String {
    format!("handoff:{token}")
}

/// Advisory integrity digest: first 8 bytes of SHA-256, hex-encoded.
fn calculate_checksum(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

impl StateStore {
    /// Connect and verify the backend with a bounded PING.
    pub async fn connect(cfg: StoreConfig) -> Result<StateStore, StoreError> {
        let client = redis::Client::open(cfg.url().as_str())?;
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Backend(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "connect timeout",
                )))
            })??;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(target: "store", addr = %cfg.addr, "state store connected");
        Ok(StateStore { conn })
    }

    /// Backend liveness probe.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Persist a snapshot. Assigns a version if the caller left it zero and
    /// recomputes the advisory checksum. The snapshot write, user-session
    /// membership, metrics counter, and metadata hash go in one pipeline.
    pub async fn save_snapshot(&self, snapshot: &mut SessionSnapshot) -> Result<(), StoreError> {
        if snapshot.version == 0 {
            snapshot.version = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        }
        snapshot.checksum.clear();
        let unsigned = serde_json::to_vec(&snapshot)?;
        snapshot.checksum = calculate_checksum(&unsigned);
        let data = serde_json::to_string(&snapshot)?;

        let ttl = SNAPSHOT_TTL.as_secs();
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(session_key(&snapshot.session_id), &data, ttl)
            .ignore()
            .sadd(user_sessions_key(&snapshot.user_id), &snapshot.session_id)
            .ignore()
            .expire(user_sessions_key(&snapshot.user_id), ttl as i64)
            .ignore()
            .hincr("metrics:snapshots", "total_count", 1)
            .ignore()
            .hset(
                session_metadata_key(&snapshot.session_id),
                "version",
                snapshot.version,
            )
            .ignore()
            .hset(
                session_metadata_key(&snapshot.session_id),
                "last_updated",
                Utc::now().timestamp(),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(
            target: "store",
            session_id = %snapshot.session_id,
            user_id = %snapshot.user_id,
            version = snapshot.version,
            "snapshot saved"
        );
        Ok(())
    }

    /// Fetch a snapshot. A missing key is `Ok(None)`; so is a record whose
    /// `expires_at` has already passed (a derived index may still name it).
    pub async fn get_snapshot(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSnapshot>, StoreError> {
        let key = session_key(session_id);
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(&key).await?;
        let Some(data) = data else {
            return Ok(None);
        };
        let snapshot: SessionSnapshot =
            serde_json::from_str(&data).map_err(|source| StoreError::Corrupt { key, source })?;
        if snapshot.is_expired() {
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    /// Fetch a snapshot, warning when the caller expected a different
    /// version. The current snapshot is returned either way.
    pub async fn get_snapshot_with_version(
        &self,
        session_id: &str,
        version: i64,
    ) -> Result<Option<SessionSnapshot>, StoreError> {
        let snapshot = self.get_snapshot(session_id).await?;
        if let Some(snapshot) = &snapshot {
            if version > 0 && snapshot.version != version {
                warn!(
                    target: "store",
                    session_id,
                    requested_version = version,
                    current_version = snapshot.version,
                    "version mismatch"
                );
            }
        }
        Ok(snapshot)
    }

    /// Read-modify-write of a diff against the current snapshot. Not
    /// isolated against concurrent writers: the later wall-clock version
    /// wins.
    pub async fn apply_incremental_update(
        &self,
        update: &IncrementalUpdate,
    ) -> Result<SessionSnapshot, StoreError> {
        let mut snapshot = match self.get_snapshot(&update.session_id).await? {
            Some(snapshot) => snapshot,
            None => SessionSnapshot::empty(&update.session_id, &update.user_id, &update.device_id),
        };

        for (key, value) in &update.changes {
            snapshot.state_data.insert(key.clone(), value.clone());
        }
        for key in &update.deleted_keys {
            snapshot.state_data.remove(key);
        }
        snapshot.touch();

        self.save_snapshot(&mut snapshot).await?;
        Ok(snapshot)
    }

    /// Session ids known for a user (derived set; may lag the truth).
    pub async fn get_user_sessions(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let sessions: Vec<String> = conn.smembers(user_sessions_key(user_id)).await?;
        Ok(sessions)
    }

    /// Register a device: presence key with a short TTL plus membership in
    /// the per-user and per-session device sets.
    pub async fn register_device(&self, device: &DeviceInfo) -> Result<(), StoreError> {
        let data = serde_json::to_string(device)?;
        let snapshot_ttl = SNAPSHOT_TTL.as_secs() as i64;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(
                device_key(&device.device_id),
                &data,
                DEVICE_PRESENCE_TTL.as_secs(),
            )
            .ignore()
            .sadd(user_devices_key(&device.user_id), &device.device_id)
            .ignore()
            .expire(user_devices_key(&device.user_id), snapshot_ttl)
            .ignore()
            .sadd(session_devices_key(&device.session_id), &device.device_id)
            .ignore()
            .expire(session_devices_key(&device.session_id), snapshot_ttl)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(
            target: "store",
            device_id = %device.device_id,
            user_id = %device.user_id,
            "device registered"
        );
        Ok(())
    }

    /// Presence heartbeat: slide the device key's TTL forward. A device
    /// whose key has lapsed is offline.
    pub async fn update_device_presence(&self, device_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: bool = conn
            .expire(device_key(device_id), DEVICE_PRESENCE_TTL.as_secs() as i64)
            .await?;
        Ok(())
    }

    pub async fn get_device_info(&self, device_id: &str) -> Result<Option<DeviceInfo>, StoreError> {
        let key = device_key(device_id);
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(&key).await?;
        match data {
            Some(data) => Ok(Some(
                serde_json::from_str(&data)
                    .map_err(|source| StoreError::Corrupt { key, source })?,
            )),
            None => Ok(None),
        }
    }

    pub async fn get_user_devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>, StoreError> {
        let mut conn = self.conn.clone();
        let device_ids: Vec<String> = conn.smembers(user_devices_key(user_id)).await?;
        self.collect_devices(device_ids).await
    }

    pub async fn get_session_devices(
        &self,
        session_id: &str,
    ) -> Result<Vec<DeviceInfo>, StoreError> {
        let mut conn = self.conn.clone();
        let device_ids: Vec<String> = conn.smembers(session_devices_key(session_id)).await?;
        self.collect_devices(device_ids).await
    }

    async fn collect_devices(&self, device_ids: Vec<String>) -> Result<Vec<DeviceInfo>, StoreError> {
        let mut devices = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            match self.get_device_info(&device_id).await {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "store", device_id, error = %err, "failed to read device info");
                }
            }
        }
        Ok(devices)
    }

    pub async fn remove_device(
        &self,
        device_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(device_key(device_id))
            .ignore()
            .srem(user_devices_key(user_id), device_id)
            .ignore()
            .srem(session_devices_key(session_id), device_id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(target: "store", device_id, user_id, "device removed");
        Ok(())
    }

    pub async fn save_handoff_token(&self, token: &HandoffToken) -> Result<(), StoreError> {
        let data = serde_json::to_string(token)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(handoff_key(&token.token), data, HANDOFF_TOKEN_TTL.as_secs())
            .await?;
        Ok(())
    }

    pub async fn get_handoff_token(
        &self,
        token: &str,
    ) -> Result<Option<HandoffToken>, StoreError> {
        let key = handoff_key(token);
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.get(&key).await?;
        match data {
            Some(data) => Ok(Some(
                serde_json::from_str(&data)
                    .map_err(|source| StoreError::Corrupt { key, source })?,
            )),
            None => Ok(None),
        }
    }

    pub async fn delete_handoff_token(&self, token: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(handoff_key(token)).await?;
        Ok(())
    }

    /// Admin-only scan: per-device session tallies.
    pub async fn get_session_metrics(&self) -> Result<SessionMetrics, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("session:*").await?;
        let snapshot_keys: Vec<&String> = keys
            .iter()
            .filter(|k| !k.ends_with(":metadata") && !k.ends_with(":devices"))
            .collect();

        let mut metrics = SessionMetrics {
            timestamp: Utc::now(),
            total_sessions: snapshot_keys.len() as i64,
            ..SessionMetrics::default()
        };

        let mut sessions_by_device: HashMap<String, i64> = HashMap::new();
        for key in snapshot_keys {
            let data: Option<String> = conn.get(key).await?;
            if let Some(data) = data {
                if let Ok(snapshot) = serde_json::from_str::<SessionSnapshot>(&data) {
                    *sessions_by_device.entry(snapshot.device_id).or_insert(0) += 1;
                }
            }
        }
        metrics.sessions_by_device = sessions_by_device;
        Ok(metrics)
    }

    /// Admin-only scan: snapshot sizes and age range.
    pub async fn get_snapshot_metrics(&self) -> Result<SnapshotMetrics, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("session:*").await?;
        let snapshot_keys: Vec<&String> = keys
            .iter()
            .filter(|k| !k.ends_with(":metadata") && !k.ends_with(":devices"))
            .collect();

        let mut metrics = SnapshotMetrics {
            timestamp: Utc::now(),
            total_snapshots: snapshot_keys.len() as i64,
            ..SnapshotMetrics::default()
        };

        let mut total_size: i64 = 0;
        let mut compressed_count: i64 = 0;
        let mut oldest: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;

        for key in snapshot_keys {
            let size: Option<i64> = redis::cmd("MEMORY")
                .arg("USAGE")
                .arg(key)
                .query_async(&mut conn)
                .await
                .unwrap_or(None);
            total_size += size.unwrap_or(0);

            let data: Option<String> = conn.get(key).await?;
            if let Some(data) = data {
                if let Ok(snapshot) = serde_json::from_str::<SessionSnapshot>(&data) {
                    if snapshot.compressed {
                        compressed_count += 1;
                    }
                    if oldest.map(|t| snapshot.created_at < t).unwrap_or(true) {
                        oldest = Some(snapshot.created_at);
                    }
                    if newest.map(|t| snapshot.created_at > t).unwrap_or(true) {
                        newest = Some(snapshot.created_at);
                    }
                }
            }
        }

        metrics.total_size = total_size;
        if metrics.total_snapshots > 0 {
            metrics.average_size = total_size as f64 / metrics.total_snapshots as f64;
        }
        metrics.compressed_snapshots = compressed_count;
        metrics.oldest_snapshot = oldest;
        metrics.newest_snapshot = newest;
        Ok(metrics)
    }

    /// Admin-only scan: every live session id.
    pub async fn get_all_session_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("session:*").await?;
        Ok(keys
            .into_iter()
            .filter(|k| !k.ends_with(":metadata") && !k.ends_with(":devices"))
            .filter_map(|k| k.strip_prefix("session:").map(|s| s.to_string()))
            .collect())
    }

    // Raw operations used by the CSRF and rate-limit middleware.

    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn delete_raw(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Increment a counter, stamping a TTL when the key is created by this
    /// call. Used for fixed-window rate limiting.
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: bool = conn.expire(key, ttl.as_secs() as i64).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(session_key("abc"), "session:abc");
        assert_eq!(session_metadata_key("abc"), "session:abc:metadata");
        assert_eq!(user_sessions_key("u1"), "user:u1:sessions");
        assert_eq!(device_key("d1"), "device:d1");
        assert_eq!(user_devices_key("u1"), "user:u1:devices");
        assert_eq!(session_devices_key("abc"), "session:abc:devices");
        assert_eq!(handoff_key("t"), "handoff:t");
    }

    #[test]
    fn test_checksum_is_short_hex() {
        let sum = calculate_checksum(b"hello");
        assert_eq!(sum.len(), 16);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
        // deterministic
        assert_eq!(sum, calculate_checksum(b"hello"));
        assert_ne!(sum, calculate_checksum(b"hellp"));
    }

    #[test]
    fn test_ttl_constants() {
        assert_eq!(SNAPSHOT_TTL.as_secs(), 7 * 24 * 3600);
        assert_eq!(DEVICE_PRESENCE_TTL.as_secs(), 120);
        assert_eq!(HANDOFF_TOKEN_TTL.as_secs(), 300);
    }
}
