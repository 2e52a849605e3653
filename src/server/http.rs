//! HTTP router assembly
//!
//! Wires the session, multi-device, and admin handlers together with the
//! middleware stack. Layer order (outermost first): CORS, rate limiting,
//! CSRF. Admin routes additionally sit behind the admin gate.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;

use crate::server::admin_auth::{admin_auth_middleware, AdminGate};
use crate::server::cors::{cors_middleware, CorsConfig};
use crate::server::csrf::{csrf_middleware, CsrfConfig, CsrfGuard};
use crate::server::handlers::{admin, multidevice, session, AppState};
use crate::server::ratelimit::{rate_limit_middleware, RateLimitConfig, RateLimiter};
use crate::server::ws::{ws_handler, WsState};

/// Middleware configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub cors: CorsConfig,
    pub csrf: CsrfConfig,
    pub rate_limit: RateLimitConfig,
    pub enable_cors: bool,
    pub enable_csrf: bool,
    pub enable_rate_limit: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        MiddlewareConfig {
            cors: CorsConfig::default(),
            csrf: CsrfConfig::default(),
            rate_limit: RateLimitConfig::default(),
            enable_cors: true,
            enable_csrf: true,
            enable_rate_limit: true,
        }
    }
}

impl MiddlewareConfig {
    /// All middleware disabled (for tests).
    pub fn none() -> Self {
        MiddlewareConfig {
            enable_cors: false,
            enable_csrf: false,
            enable_rate_limit: false,
            ..MiddlewareConfig::default()
        }
    }
}

/// Create the full router: session CRUD, multi-device ops, admin surfaces,
/// the WebSocket endpoint, and the middleware stack.
pub fn create_router(
    app_state: AppState,
    ws_state: WsState,
    admin_gate: AdminGate,
    middleware_config: MiddlewareConfig,
) -> Router {
    let admin_router = Router::new()
        .route("/metrics/sessions", get(admin::get_session_metrics))
        .route("/metrics/connections", get(admin::get_connection_metrics))
        .route("/metrics/snapshots", get(admin::get_snapshot_metrics))
        .route("/metrics/all", get(admin::get_all_metrics))
        .route("/sessions", get(admin::get_active_sessions))
        .route("/connections", get(admin::get_active_connections))
        .route("/broadcast", post(admin::broadcast_admin_message))
        .route_layer(middleware::from_fn_with_state(
            admin_gate,
            admin_auth_middleware,
        ))
        .with_state(app_state.clone());

    let api_router = Router::new()
        .route("/health", get(session::health_check))
        .route("/session/snapshot", post(session::create_snapshot))
        .route("/session/incremental", post(session::apply_incremental_update))
        .route("/session/conflict/resolve", post(session::resolve_conflict))
        .route("/session/:uuid", get(session::get_snapshot))
        .route("/session/:uuid/devices", get(multidevice::get_session_devices))
        .route("/session/:uuid/handoff", post(multidevice::initiate_handoff))
        .route(
            "/session/:uuid/handoff/:token",
            get(multidevice::validate_handoff_token),
        )
        .route(
            "/session/:uuid/device/:device_id",
            delete(multidevice::disconnect_device),
        )
        .with_state(app_state.clone());

    let ws_router = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(ws_state);

    let mut router = api_router.nest("/admin", admin_router).merge(ws_router);

    // Layer order matters: last added runs first, so CSRF is innermost and
    // CORS answers preflights before anything else sees the request.
    if middleware_config.enable_csrf {
        let guard = CsrfGuard::new(app_state.store.clone(), middleware_config.csrf);
        router = router.layer(middleware::from_fn_with_state(guard, csrf_middleware));
    }
    if middleware_config.enable_rate_limit {
        let limiter = RateLimiter::new(
            app_state.store.clone(),
            app_state.authority.clone(),
            middleware_config.rate_limit,
        );
        router = router.layer(middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ));
    }
    if middleware_config.enable_cors {
        let cors = Arc::new(middleware_config.cors);
        router = router.layer(middleware::from_fn_with_state(cors, cors_middleware));
    }

    router.layer(middleware::from_fn(request_timeout_middleware))
}

/// Per-request deadline matching the server's 60 s read/write budget. The
/// WebSocket upgrade completes within this window; the upgraded connection
/// itself runs outside it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

async fn request_timeout_middleware(req: Request<Body>, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_TIMEOUT, next.run(req)).await {
        Ok(response) => response,
        Err(_) => StatusCode::REQUEST_TIMEOUT.into_response(),
    }
}
