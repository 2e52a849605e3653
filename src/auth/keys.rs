//! Rotating HMAC key set.
//!
//! A named window `{current, previous, next}` plus a standalone `refresh`
//! key. The window slides on rotation; `refresh` signs long-lived refresh
//! tokens only and never rotates on the schedule.

use std::fmt;

use chrono::Utc;
use tracing::info;

use super::AuthError;

/// Minimum secret length in bytes. Shorter keys are rejected at load.
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Clone)]
pub struct KeySet {
    pub(crate) current: String,
    pub(crate) previous: Option<String>,
    pub(crate) next: Option<String>,
    pub(crate) refresh: String,
    pub(crate) key_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("{name} secret must be at least {MIN_SECRET_LEN} bytes")]
    TooShort { name: &'static str },
}

impl KeySet {
    /// Build a key set, rejecting any secret shorter than
    /// [`MIN_SECRET_LEN`]. Optional window keys may be absent but not short.
    pub fn new(
        current: String,
        refresh: String,
        previous: Option<String>,
        next: Option<String>,
        key_id: Option<String>,
    ) -> Result<KeySet, KeyError> {
        check_len("current", &current)?;
        check_len("refresh", &refresh)?;
        if let Some(previous) = &previous {
            check_len("previous", previous)?;
        }
        if let Some(next) = &next {
            check_len("next", next)?;
        }
        Ok(KeySet {
            current,
            previous,
            next,
            refresh,
            key_id: key_id.unwrap_or_else(|| "current".to_string()),
        })
    }

    /// Secrets tried during validation, in order.
    pub(crate) fn validation_window(&self) -> Vec<(&'static str, String)> {
        let mut window = vec![("current", self.current.clone())];
        if let Some(previous) = &self.previous {
            window.push(("previous", previous.clone()));
        }
        if let Some(next) = &self.next {
            window.push(("next", next.clone()));
        }
        window
    }

    /// Slide the window: `previous ← current`, `current ← next`,
    /// `next ← ∅`. When no `next` is staged, `fallback_next` (typically a
    /// freshly read `JWT_SECRET_NEXT`) is consumed instead; with neither,
    /// rotation fails and the set is left untouched.
    pub fn rotate(&mut self, fallback_next: Option<String>) -> Result<(), AuthError> {
        let incoming = match self.next.take() {
            Some(next) => next,
            None => match fallback_next.filter(|s| s.len() >= MIN_SECRET_LEN) {
                Some(next) => next,
                None => return Err(AuthError::RotationBlocked),
            },
        };
        self.previous = Some(std::mem::replace(&mut self.current, incoming));
        self.key_id = format!("key_{}", Utc::now().timestamp());
        info!(target: "auth", new_key_id = %self.key_id, "signing keys rotated");
        Ok(())
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

fn check_len(name: &'static str, secret: &str) -> Result<(), KeyError> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(KeyError::TooShort { name });
    }
    Ok(())
}

// Secrets never appear in Debug output.
impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("key_id", &self.key_id)
            .field("has_previous", &self.previous.is_some())
            .field("has_next", &self.next.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(tag: &str) -> String {
        format!("{tag}-{}", "x".repeat(MIN_SECRET_LEN))
    }

    #[test]
    fn test_short_secret_rejected() {
        let err = KeySet::new("short".into(), secret("r"), None, None, None);
        assert!(err.is_err());
        let err = KeySet::new(secret("c"), "short".into(), None, None, None);
        assert!(err.is_err());
        let err = KeySet::new(secret("c"), secret("r"), Some("short".into()), None, None);
        assert!(err.is_err());
    }

    #[test]
    fn test_rotation_slides_window() {
        let mut keys = KeySet::new(
            secret("k1"),
            secret("r"),
            None,
            Some(secret("k2")),
            None,
        )
        .unwrap();
        keys.rotate(None).unwrap();
        assert_eq!(keys.previous.as_deref(), Some(secret("k1").as_str()));
        assert_eq!(keys.current, secret("k2"));
        assert!(keys.next.is_none());
        assert!(keys.key_id.starts_with("key_"));
    }

    #[test]
    fn test_rotation_without_next_fails_and_preserves() {
        let mut keys = KeySet::new(secret("k1"), secret("r"), None, None, None).unwrap();
        let err = keys.rotate(None);
        assert!(matches!(err, Err(AuthError::RotationBlocked)));
        assert_eq!(keys.current, secret("k1"));
        assert!(keys.previous.is_none());
    }

    #[test]
    fn test_rotation_consumes_fallback_next() {
        let mut keys = KeySet::new(secret("k1"), secret("r"), None, None, None).unwrap();
        keys.rotate(Some(secret("k2"))).unwrap();
        assert_eq!(keys.current, secret("k2"));
        assert_eq!(keys.previous.as_deref(), Some(secret("k1").as_str()));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let keys = KeySet::new(secret("k1"), secret("r"), None, None, None).unwrap();
        let printed = format!("{keys:?}");
        assert!(!printed.contains(&secret("k1")));
        assert!(!printed.contains(&secret("r")));
    }
}
