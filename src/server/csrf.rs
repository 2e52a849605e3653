//! CSRF protection middleware
//!
//! Double-submit scheme bound per session: the token lives in the
//! `csrf_token` cookie and the `X-CSRF-Token` header, with the server-side
//! copy stored under `csrf:{session_id}` in the backing store. `GET`,
//! `HEAD`, and `OPTIONS` bypass validation but mint a token for the session
//! when one is missing.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::RngCore;
use serde_json::json;
use tracing::warn;

use crate::store::StateStore;

/// Random bytes per token (before base64 encoding).
const TOKEN_BYTES: usize = 32;

/// Server-side token lifetime.
const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const COOKIE_NAME: &str = "csrf_token";
const HEADER_NAME: &str = "x-csrf-token";

#[derive(Debug, Clone)]
pub struct CsrfConfig {
    /// Secure cookie flag; on in production.
    pub secure_cookie: bool,
    pub enabled: bool,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        CsrfConfig {
            secure_cookie: true,
            enabled: true,
        }
    }
}

#[derive(Clone)]
pub struct CsrfGuard {
    store: StateStore,
    config: Arc<CsrfConfig>,
}

impl CsrfGuard {
    pub fn new(store: StateStore, config: CsrfConfig) -> CsrfGuard {
        CsrfGuard {
            store,
            config: Arc::new(config),
        }
    }

    fn store_key(session_id: &str) -> String {
        format!("csrf:{session_id}")
    }

    async fn mint_token(&self, session_id: &str) -> Option<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE.encode(bytes);
        match self
            .store
            .set_with_ttl(&Self::store_key(session_id), &token, TOKEN_TTL)
            .await
        {
            Ok(()) => Some(token),
            Err(err) => {
                warn!(target: "http", error = %err, "failed to store csrf token");
                None
            }
        }
    }

    async fn validate(&self, session_id: &str, presented: &str) -> bool {
        match self.store.get_raw(&Self::store_key(session_id)).await {
            Ok(Some(stored)) => crate::auth::timing_safe_eq(&stored, presented),
            Ok(None) => false,
            Err(err) => {
                warn!(target: "http", error = %err, "failed to read csrf token");
                false
            }
        }
    }
}

pub async fn csrf_middleware(
    State(guard): State<CsrfGuard>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !guard.config.enabled {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let session_id = extract_session_id(&req);
    let safe_method =
        method == Method::GET || method == Method::HEAD || method == Method::OPTIONS;

    if safe_method {
        let mut minted = None;
        if extract_token(&req).is_none() {
            if let Some(session_id) = &session_id {
                minted = guard.mint_token(session_id).await;
            }
        }
        let mut response = next.run(req).await;
        if let Some(token) = minted {
            set_token_cookie(&mut response, &token, guard.config.secure_cookie);
        }
        return response;
    }

    let Some(token) = extract_token(&req) else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "CSRF token missing"})),
        )
            .into_response();
    };

    let valid = match &session_id {
        Some(session_id) => guard.validate(session_id, &token).await,
        None => false,
    };
    if !valid {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid CSRF token"})),
        )
            .into_response();
    }

    let secure = guard.config.secure_cookie;
    let mut response = next.run(req).await;
    set_token_cookie(&mut response, &token, secure);
    response
}

/// Token from the header, falling back to the double-submit cookie.
fn extract_token(req: &Request<Body>) -> Option<String> {
    if let Some(token) = req
        .headers()
        .get(HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }
    cookie_value(req, COOKIE_NAME)
}

/// The session this token is bound to: `X-Session-ID` header or
/// `session_id` query parameter.
fn extract_session_id(req: &Request<Body>) -> Option<String> {
    if let Some(sid) = req
        .headers()
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        return Some(sid.to_string());
    }
    let query = req.uri().query()?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("session_id=") {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn cookie_value(req: &Request<Body>, name: &str) -> Option<String> {
    let cookies = req.headers().get("cookie")?.to_str().ok()?;
    for part in cookies.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(name) {
            if let Some(value) = value.strip_prefix('=') {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn set_token_cookie(response: &mut Response, token: &str, secure: bool) {
    let mut cookie = format!(
        "{COOKIE_NAME}={token}; Path=/; Max-Age={}; SameSite=Lax; HttpOnly",
        TOKEN_TTL.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().append("set-cookie", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_headers(pairs: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri("/session/snapshot");
        for (name, value) in pairs {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_token_prefers_header() {
        let req = request_with_headers(&[
            (HEADER_NAME, "header-token"),
            ("cookie", "csrf_token=cookie-token"),
        ]);
        assert_eq!(extract_token(&req).as_deref(), Some("header-token"));
    }

    #[test]
    fn test_extract_token_falls_back_to_cookie() {
        let req = request_with_headers(&[("cookie", "other=1; csrf_token=cookie-token")]);
        assert_eq!(extract_token(&req).as_deref(), Some("cookie-token"));
    }

    #[test]
    fn test_extract_session_id_from_query() {
        let req = Request::builder()
            .uri("/session/snapshot?session_id=abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_session_id(&req).as_deref(), Some("abc"));
    }

    #[test]
    fn test_extract_session_id_header_wins() {
        let mut req = Request::builder()
            .uri("/session/snapshot?session_id=from-query")
            .body(Body::empty())
            .unwrap();
        req.headers_mut()
            .insert("x-session-id", HeaderValue::from_static("from-header"));
        assert_eq!(extract_session_id(&req).as_deref(), Some("from-header"));
    }
}
