//! HTTP surface handlers
//!
//! Stateless request handlers over the store, hub, and token authority.
//! Backend failures are translated to surface errors; backend text never
//! reaches a response body.

pub mod admin;
pub mod multidevice;
pub mod session;

use std::sync::Arc;
use std::time::Instant;

use crate::auth::TokenAuthority;
use crate::hub::HubHandle;
use crate::store::StateStore;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub hub: HubHandle,
    pub authority: Arc<TokenAuthority>,
    pub start_time: Instant,
}
