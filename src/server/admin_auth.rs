//! Admin route gating.
//!
//! Two accepted credentials:
//! - a bearer JWT whose roles include `admin` or `superadmin`
//! - the `X-Admin-Token` header, checked against a bcrypt-hashed server
//!   token (when one is configured)
//!
//! Validated claims are stashed in request extensions for handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::auth::{self, AdminToken, TokenAuthority};

#[derive(Clone)]
pub struct AdminGate {
    authority: Arc<TokenAuthority>,
    admin_token: Option<Arc<AdminToken>>,
}

impl AdminGate {
    pub fn new(authority: Arc<TokenAuthority>, admin_token: Option<AdminToken>) -> AdminGate {
        AdminGate {
            authority,
            admin_token: admin_token.map(Arc::new),
        }
    }
}

pub async fn admin_auth_middleware(
    State(gate): State<AdminGate>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(presented) = req
        .headers()
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
    {
        match &gate.admin_token {
            Some(admin_token) if admin_token.verify(presented) => {
                return next.run(req).await;
            }
            _ => {
                warn!(target: "http", "invalid admin token");
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": "Invalid admin token"})),
                )
                    .into_response();
            }
        }
    }

    let Some(token) = bearer_token(&req) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized"})),
        )
            .into_response();
    };

    let claims = match gate.authority.validate(&token) {
        Ok(claims) => claims,
        Err(err) => {
            warn!(target: "http", path = %req.uri().path(), error = %err, "admin token validation failed");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Invalid or expired token"})),
            )
                .into_response();
        }
    };

    if !auth::is_admin(&claims.roles) {
        warn!(
            target: "http",
            user_id = %claims.user_id,
            path = %req.uri().path(),
            "unauthorized admin access attempt"
        );
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Admin access required"})),
        )
            .into_response();
    }

    req.extensions_mut().insert(claims);
    next.run(req).await
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
