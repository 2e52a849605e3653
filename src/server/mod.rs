//! Server module
//!
//! HTTP and WebSocket surfaces plus the security middleware stack.

pub mod admin_auth;
pub mod cors;
pub mod csrf;
pub mod handlers;
pub mod http;
pub mod ratelimit;
pub mod ws;

pub use handlers::AppState;
pub use http::{create_router, MiddlewareConfig};
pub use ws::WsState;
