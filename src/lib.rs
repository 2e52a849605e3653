//! syncbridge library
//!
//! Session-state synchronization service: a single-writer connection hub,
//! a Redis-backed snapshot store, a rotating-key token authority, and the
//! HTTP/WebSocket surfaces that tie them together.

pub mod auth;
pub mod config;
pub mod hub;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod store;
