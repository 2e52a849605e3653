//! JWT token generation and verification under the rotating key window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use super::{AuthError, KeySet, UserClaims};

/// Access token lifetime.
pub const TOKEN_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Refresh token lifetime.
pub const REFRESH_TOKEN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Wire-format claims. `exp`/`iat`/`nbf` are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JwtClaims {
    user_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    session_id: String,
    exp: i64,
    #[serde(default)]
    iat: i64,
    #[serde(default)]
    nbf: i64,
}

impl JwtClaims {
    fn into_user_claims(self) -> UserClaims {
        UserClaims {
            user_id: self.user_id,
            email: self.email,
            roles: self.roles,
            device_id: self.device_id,
            session_id: self.session_id,
            exp: self.exp,
        }
    }
}

/// Mints and validates bearer tokens under a rotating key window.
///
/// The key set is the only mutable state; validators snapshot the window
/// under a brief read lock, rotation takes the write lock.
pub struct TokenAuthority {
    keys: RwLock<KeySet>,
}

impl TokenAuthority {
    pub fn new(keys: KeySet) -> TokenAuthority {
        TokenAuthority {
            keys: RwLock::new(keys),
        }
    }

    /// Mint an access token signed with the current key: `iat`/`nbf` = now,
    /// `exp` = now + 15 minutes.
    pub fn mint(&self, claims: &UserClaims) -> Result<String, AuthError> {
        let secret = self.keys.read().current.clone();
        sign(claims, &secret, TOKEN_EXPIRY)
    }

    /// Mint a long-lived refresh token signed with the refresh key.
    pub fn mint_refresh(&self, claims: &UserClaims) -> Result<String, AuthError> {
        let secret = self.keys.read().refresh.clone();
        sign(claims, &secret, REFRESH_TOKEN_EXPIRY)
    }

    /// Validate against the window `{current, previous, next}` in order.
    /// The first key whose HMAC matches wins; an authentic-but-expired
    /// token yields [`AuthError::TokenExpired`] with the decoded claims.
    pub fn validate(&self, token: &str) -> Result<UserClaims, AuthError> {
        let window = self.keys.read().validation_window();
        for (key_id, secret) in window {
            match verify(token, &secret) {
                Ok(claims) => {
                    if key_id != "current" {
                        info!(
                            target: "auth",
                            key_id,
                            user_id = %claims.user_id,
                            "token validated with non-current key"
                        );
                    }
                    return Ok(claims);
                }
                Err(AuthError::TokenExpired(claims)) => {
                    return Err(AuthError::TokenExpired(claims));
                }
                Err(_) => continue,
            }
        }
        Err(AuthError::InvalidToken)
    }

    /// Validate a refresh token (refresh key only, never the window).
    pub fn validate_refresh(&self, token: &str) -> Result<UserClaims, AuthError> {
        let secret = self.keys.read().refresh.clone();
        verify(token, &secret)
    }

    /// Re-mint a token carrying the same identity with a fresh expiry.
    /// Accepts an expired token as long as its signature matches a window
    /// key; a tampered token cannot be refreshed.
    pub fn refresh(&self, token: &str) -> Result<(String, UserClaims), AuthError> {
        let claims = match self.validate(token) {
            Ok(claims) => claims,
            Err(AuthError::TokenExpired(claims)) => claims,
            Err(err) => return Err(err),
        };
        let minted = self.mint(&claims)?;
        Ok((minted, claims))
    }

    /// Slide the key window. Atomic with respect to validation.
    pub fn rotate(&self, fallback_next: Option<String>) -> Result<(), AuthError> {
        self.keys.write().rotate(fallback_next)
    }

    /// Stage a replacement `next` key for the following rotation.
    pub fn set_next_key(&self, next: String) {
        self.keys.write().next = Some(next);
    }

    /// Non-secret description of the window, for admin surfaces.
    pub fn key_info(&self) -> Value {
        let keys = self.keys.read();
        json!({
            "current_key_id": keys.key_id(),
            "has_previous": keys.has_previous(),
            "has_next": keys.has_next(),
        })
    }
}

fn sign(claims: &UserClaims, secret: &str, expiry: Duration) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let jwt_claims = JwtClaims {
        user_id: claims.user_id.clone(),
        email: claims.email.clone(),
        roles: claims.roles.clone(),
        device_id: claims.device_id.clone(),
        session_id: claims.session_id.clone(),
        exp: now + expiry.as_secs() as i64,
        iat: now,
        nbf: now,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &jwt_claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidToken)
}

/// Verify signature and algorithm first (HS256 only — any other `alg`,
/// including `none`, fails before the MAC is checked), then check `exp`
/// manually so authentic-but-expired tokens surface their claims.
fn verify(token: &str, secret: &str) -> Result<UserClaims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.required_spec_claims.clear();

    let data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| AuthError::InvalidToken)?;

    let exp = data.claims.exp;
    let claims = data.claims.into_user_claims();
    if exp < Utc::now().timestamp() {
        return Err(AuthError::TokenExpired(claims));
    }
    Ok(claims)
}

/// Background rotation schedule. Failure to rotate (no staged `next`) is
/// logged and retried on the following tick with the window unchanged.
pub fn spawn_rotation_schedule(
    authority: Arc<TokenAuthority>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick completes immediately
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let fallback = std::env::var("JWT_SECRET_NEXT").ok();
                    if let Err(err) = authority.rotate(fallback) {
                        error!(target: "auth", error = %err, "scheduled key rotation failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    fn secret(tag: &str) -> String {
        format!("{tag}-{}", "x".repeat(super::super::MIN_SECRET_LEN))
    }

    fn authority_with(next: Option<String>) -> TokenAuthority {
        let keys = KeySet::new(secret("k1"), secret("refresh"), None, next, None).unwrap();
        TokenAuthority::new(keys)
    }

    fn sample_claims() -> UserClaims {
        UserClaims {
            user_id: "user-1".into(),
            email: "user@example.com".into(),
            roles: vec!["user".into()],
            device_id: "device-1".into(),
            session_id: "session-1".into(),
            exp: 0,
        }
    }

    #[test]
    fn test_mint_validate_roundtrip() {
        let authority = authority_with(None);
        let token = authority.mint(&sample_claims()).unwrap();
        let claims = authority.validate(&token).unwrap();
        assert_eq!(claims.user_id, "user-1");
        assert_eq!(claims.email, "user@example.com");
        assert_eq!(claims.device_id, "device-1");
        assert_eq!(claims.session_id, "session-1");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_expired_token_surfaces_claims() {
        let authority = authority_with(None);
        // Sign an already-expired token with the current key.
        let keys_secret = secret("k1");
        let claims = sample_claims();
        let now = Utc::now().timestamp();
        let jwt_claims = JwtClaims {
            user_id: claims.user_id.clone(),
            email: claims.email.clone(),
            roles: claims.roles.clone(),
            device_id: claims.device_id.clone(),
            session_id: claims.session_id.clone(),
            exp: now - 60,
            iat: now - 120,
            nbf: now - 120,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &jwt_claims,
            &EncodingKey::from_secret(keys_secret.as_bytes()),
        )
        .unwrap();

        match authority.validate(&token) {
            Err(AuthError::TokenExpired(claims)) => {
                assert_eq!(claims.user_id, "user-1");
            }
            other => panic!("expected TokenExpired, got {other:?}"),
        }
        // An expired-but-authentic token can still be refreshed.
        let (fresh, refreshed) = authority.refresh(&token).unwrap();
        assert_eq!(refreshed.user_id, "user-1");
        assert!(authority.validate(&fresh).is_ok());
    }

    #[test]
    fn test_algorithm_lock_rejects_other_hmacs() {
        let authority = authority_with(None);
        let jwt_claims = JwtClaims {
            user_id: "user-1".into(),
            email: String::new(),
            roles: Vec::new(),
            device_id: String::new(),
            session_id: String::new(),
            exp: Utc::now().timestamp() + 600,
            iat: 0,
            nbf: 0,
        };
        for alg in [Algorithm::HS384, Algorithm::HS512] {
            let token = encode(
                &Header::new(alg),
                &jwt_claims,
                &EncodingKey::from_secret(secret("k1").as_bytes()),
            )
            .unwrap();
            assert!(matches!(
                authority.validate(&token),
                Err(AuthError::InvalidToken)
            ));
        }
    }

    #[test]
    fn test_algorithm_lock_rejects_alg_none() {
        let authority = authority_with(None);
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            format!(
                r#"{{"user_id":"user-1","exp":{}}}"#,
                Utc::now().timestamp() + 600
            )
            .as_bytes(),
        );
        let token = format!("{header}.{payload}.");
        assert!(matches!(
            authority.validate(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let authority = authority_with(None);
        let token = authority.mint(&sample_claims()).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('A') { 'B' } else { 'A' });
        assert!(matches!(
            authority.validate(&tampered),
            Err(AuthError::InvalidToken)
        ));
        assert!(authority.refresh(&tampered).is_err());
    }

    #[test]
    fn test_rotation_continuity() {
        let authority = authority_with(Some(secret("k2")));
        let token = authority.mint(&sample_claims()).unwrap();

        // One rotation: the old current becomes previous and still validates.
        authority.rotate(None).unwrap();
        assert!(authority.validate(&token).is_ok());

        // Two rotations: the key leaves the window.
        authority.set_next_key(secret("k3"));
        authority.rotate(None).unwrap();
        assert!(matches!(
            authority.validate(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_rotation_blocked_preserves_validation() {
        let authority = authority_with(None);
        let token = authority.mint(&sample_claims()).unwrap();
        assert!(matches!(
            authority.rotate(None),
            Err(AuthError::RotationBlocked)
        ));
        assert!(authority.validate(&token).is_ok());
    }

    #[test]
    fn test_refresh_token_uses_refresh_key_only() {
        let authority = authority_with(None);
        let refresh_token = authority.mint_refresh(&sample_claims()).unwrap();
        // A refresh token does not validate under the access window.
        assert!(authority.validate(&refresh_token).is_err());
        assert!(authority.validate_refresh(&refresh_token).is_ok());
    }
}
