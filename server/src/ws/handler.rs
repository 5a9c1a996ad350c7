use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::state::AppState;
use crate::ws::actor;

/// GET {ws.path} — WebSocket upgrade endpoint.
/// No credentials are checked here: the client identifies itself with the
/// registration message once the socket is open.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max_message_bytes = state.ws.max_message_bytes;

    ws.max_message_size(max_message_bytes)
        .max_frame_size(max_message_bytes)
        .on_failed_upgrade(|err| {
            tracing::warn!(error = %err, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| {
            let connections = state.connections.clone();
            connections.track_future(actor::run_connection(socket, state))
        })
}
