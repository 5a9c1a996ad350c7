//! Per-user WebSocket connections for server-initiated delivery.
//!
//! A client opens a socket, sends `{"type":"register","userId":"..."}` as its
//! first message, and from then on can be reached with
//! [`ConnectionRegistry::send_to_user`].

pub mod actor;
pub mod connection;
pub mod handler;
pub mod handshake;
pub mod registry;

use axum::{routing::get, Router};

use crate::state::AppState;

pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Delivery};

/// Attach the WebSocket accept endpoint to `router` at `path`.
pub fn initialize(router: Router<AppState>, path: &str) -> Router<AppState> {
    router.route(path, get(handler::ws_upgrade))
}
