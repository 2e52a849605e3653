//! CORS middleware
//!
//! Echoes the request origin iff it appears in the allowlist. Matching is
//! exact (ASCII case-insensitive) — no prefix or suffix tolerance, so
//! `https://app.example.com.evil.com` never matches an allowed
//! `https://app.example.com`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

/// Preflight cache lifetime.
const PREFLIGHT_MAX_AGE_SECS: u32 = 86400;

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: &'static str,
    pub allowed_headers: &'static str,
    pub exposed_headers: &'static str,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        CorsConfig {
            allowed_origins: Vec::new(),
            allowed_methods: "GET, POST, PUT, DELETE, PATCH, OPTIONS",
            allowed_headers: "Origin, Content-Type, Accept, Authorization, \
                              X-CSRF-Token, X-Session-ID, X-User-ID, X-Request-ID",
            exposed_headers: "Content-Length, X-RateLimit-Limit, X-RateLimit-Remaining",
            allow_credentials: true,
        }
    }
}

impl CorsConfig {
    pub fn with_origins(allowed_origins: Vec<String>) -> CorsConfig {
        CorsConfig {
            allowed_origins,
            ..CorsConfig::default()
        }
    }

    /// The origin value to echo, if the request origin is allowed.
    /// A configured `*` matches anything and echoes `*`.
    fn resolve_origin(&self, request_origin: &str) -> Option<String> {
        if request_origin.is_empty() {
            return None;
        }
        for allowed in &self.allowed_origins {
            if allowed == "*" {
                return Some("*".to_string());
            }
            if allowed.eq_ignore_ascii_case(request_origin) {
                return Some(request_origin.to_string());
            }
        }
        None
    }
}

pub async fn cors_middleware(
    State(config): State<Arc<CorsConfig>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let origin = req
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let resolved = config.resolve_origin(&origin);
    if resolved.is_none() && !origin.is_empty() {
        debug!(target: "http", origin, "origin not allowed");
    }

    let is_preflight = req.method() == Method::OPTIONS;
    let mut response = if is_preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    if let Some(allowed_origin) = &resolved {
        if let Ok(value) = HeaderValue::from_str(allowed_origin) {
            headers.insert("access-control-allow-origin", value);
        }
        // Credentials only make sense for an explicit, non-wildcard match.
        if config.allow_credentials && allowed_origin != "*" {
            headers.insert(
                "access-control-allow-credentials",
                HeaderValue::from_static("true"),
            );
        }
    }
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(config.allowed_methods),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(config.allowed_headers),
    );
    headers.insert(
        "access-control-expose-headers",
        HeaderValue::from_static(config.exposed_headers),
    );
    if let Ok(value) = HeaderValue::from_str(&PREFLIGHT_MAX_AGE_SECS.to_string()) {
        headers.insert("access-control-max-age", value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(origins: &[&str]) -> CorsConfig {
        CorsConfig::with_origins(origins.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_exact_origin_matches() {
        let cfg = config(&["https://app.example.com"]);
        assert_eq!(
            cfg.resolve_origin("https://app.example.com").as_deref(),
            Some("https://app.example.com")
        );
        assert_eq!(
            cfg.resolve_origin("HTTPS://APP.EXAMPLE.COM").as_deref(),
            Some("HTTPS://APP.EXAMPLE.COM")
        );
    }

    #[test]
    fn test_suffix_and_prefix_variants_rejected() {
        let cfg = config(&["https://app.example.com"]);
        assert!(cfg.resolve_origin("https://app.example.com.evil.com").is_none());
        assert!(cfg.resolve_origin("https://app.example.com/").is_none());
        assert!(cfg.resolve_origin("https://app.example.com:8443").is_none());
        assert!(cfg.resolve_origin("https://evil.com").is_none());
    }

    #[test]
    fn test_wildcard_echoes_star() {
        let cfg = config(&["*"]);
        assert_eq!(cfg.resolve_origin("https://anything.test").as_deref(), Some("*"));
    }

    #[test]
    fn test_empty_origin_never_matches() {
        let cfg = config(&["*"]);
        assert!(cfg.resolve_origin("").is_none());
    }
}
