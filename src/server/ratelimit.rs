//! Rate limiting middleware
//!
//! Fixed one-minute windows counted in the backing store, so every process
//! replica shares the same budget:
//! - per client IP (default 100 req/min)
//! - per user (default 1000 req/min), identified by `X-User-ID` or by
//!   validating the bearer token
//!
//! Window keys are `ratelimit:{scope}:{minute}` with a 2-minute entry TTL.
//! A backend failure fails open — rate limiting degrades, requests pass.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::{error, warn};

use crate::auth::TokenAuthority;
use crate::store::StateStore;

/// Entry TTL; two windows so an in-flight window never loses its counter.
const WINDOW_ENTRY_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub ip_requests_per_minute: i64,
    pub user_requests_per_minute: i64,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            ip_requests_per_minute: 100,
            user_requests_per_minute: 1000,
            enabled: true,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: StateStore,
    authority: Arc<TokenAuthority>,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(
        store: StateStore,
        authority: Arc<TokenAuthority>,
        config: RateLimitConfig,
    ) -> RateLimiter {
        RateLimiter {
            store,
            authority,
            config: Arc::new(config),
        }
    }

    /// Count one hit in the scope's current window. `Ok(true)` means over
    /// the limit.
    async fn check(&self, scope: &str, limit: i64) -> bool {
        let window_start = Utc::now().timestamp() / 60 * 60;
        let key = format!("ratelimit:{scope}:{window_start}");
        match self.store.incr_with_ttl(&key, WINDOW_ENTRY_TTL).await {
            Ok(count) => count > limit,
            Err(err) => {
                error!(target: "http", error = %err, "rate limiter check failed");
                false
            }
        }
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.config.enabled {
        return next.run(req).await;
    }

    let client_ip = addr.ip().to_string();
    if limiter
        .check(
            &format!("ip:{client_ip}"),
            limiter.config.ip_requests_per_minute,
        )
        .await
    {
        warn!(target: "http", client_ip, "ip rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate limit exceeded",
                "message": "Too many requests from this IP",
            })),
        )
            .into_response();
    }

    // The per-user budget needs an identity: an explicit X-User-ID header,
    // or the user_id of a *validated* bearer token.
    let user_id = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            bearer_token(&req)
                .and_then(|token| limiter.authority.validate(&token).ok())
                .map(|claims| claims.user_id)
        });

    if let Some(user_id) = user_id {
        if limiter
            .check(
                &format!("user:{user_id}"),
                limiter.config.user_requests_per_minute,
            )
            .await
        {
            warn!(target: "http", user_id, "user rate limit exceeded");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "rate limit exceeded",
                    "message": "Too many requests for this user",
                })),
            )
                .into_response();
        }
    }

    let limit = limiter.config.ip_requests_per_minute;
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        response.headers_mut().insert("x-ratelimit-limit", value);
    }
    response
}

fn bearer_token(req: &Request<Body>) -> Option<String> {
    let header = req.headers().get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
