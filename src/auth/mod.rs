//! Authentication and authorization
//!
//! Bearer-token identity (HS256 JWTs under a rotating key window), role
//! checks, timing-safe comparisons, and the bcrypt-hashed admin API token.

pub mod keys;
pub mod tokens;

pub use keys::{KeySet, MIN_SECRET_LEN};
pub use tokens::{TokenAuthority, REFRESH_TOKEN_EXPIRY, TOKEN_EXPIRY};

use serde::{Deserialize, Serialize};

/// Identity carried by a validated bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    /// Signature matched a window key but `exp` is past. Carries the
    /// decoded claims so refresh paths can reuse the identity.
    #[error("token expired")]
    TokenExpired(UserClaims),
    #[error("unauthorized")]
    Unauthorized,
    #[error("key rotation failed: next key not configured")]
    RotationBlocked,
}

/// Role-gated authorization. `admin` covers every role except `superadmin`;
/// `superadmin` covers everything.
pub fn is_authorized(roles: &[String], required: &str) -> bool {
    roles.iter().any(|role| {
        role == required
            || role == "superadmin"
            || (role == "admin" && required != "superadmin")
    })
}

pub fn is_admin(roles: &[String]) -> bool {
    roles.iter().any(|r| r == "admin" || r == "superadmin")
}

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Server-side admin API token. Stored as a bcrypt hash; falls back to a
/// constant-time comparison of the raw value if hashing fails at startup.
pub struct AdminToken {
    stored: StoredAdminToken,
}

enum StoredAdminToken {
    Hashed(String),
    Plain(String),
}

impl AdminToken {
    pub fn new(token: &str) -> AdminToken {
        match bcrypt::hash(token, bcrypt::DEFAULT_COST) {
            Ok(hash) => AdminToken {
                stored: StoredAdminToken::Hashed(hash),
            },
            Err(err) => {
                tracing::warn!(target: "auth", error = %err, "failed to hash admin API token");
                AdminToken {
                    stored: StoredAdminToken::Plain(token.to_string()),
                }
            }
        }
    }

    pub fn verify(&self, presented: &str) -> bool {
        match &self.stored {
            StoredAdminToken::Hashed(hash) => bcrypt::verify(presented, hash).unwrap_or(false),
            StoredAdminToken::Plain(token) => timing_safe_eq(token, presented),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq("abc", "abc"));
        assert!(!timing_safe_eq("abc", "abd"));
        assert!(!timing_safe_eq("abc", "ab"));
        assert!(timing_safe_eq("", ""));
    }

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_role_authorizes() {
        assert!(is_authorized(&roles(&["viewer"]), "viewer"));
        assert!(!is_authorized(&roles(&["viewer"]), "editor"));
    }

    #[test]
    fn test_admin_is_superset_except_superadmin() {
        assert!(is_authorized(&roles(&["admin"]), "viewer"));
        assert!(is_authorized(&roles(&["admin"]), "admin"));
        assert!(!is_authorized(&roles(&["admin"]), "superadmin"));
    }

    #[test]
    fn test_superadmin_is_superset_of_all() {
        assert!(is_authorized(&roles(&["superadmin"]), "viewer"));
        assert!(is_authorized(&roles(&["superadmin"]), "admin"));
        assert!(is_authorized(&roles(&["superadmin"]), "superadmin"));
    }

    #[test]
    fn test_is_admin() {
        assert!(is_admin(&roles(&["admin"])));
        assert!(is_admin(&roles(&["superadmin", "viewer"])));
        assert!(!is_admin(&roles(&["viewer"])));
        assert!(!is_admin(&[]));
    }

    #[test]
    fn test_admin_token_verify() {
        let token = AdminToken::new("swordfish");
        assert!(token.verify("swordfish"));
        assert!(!token.verify("SWORDFISH"));
        assert!(!token.verify(""));
    }
}
