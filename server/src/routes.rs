use axum::{routing::get, routing::post, Router};

use crate::notify;
use crate::state::AppState;
use crate::ws;

/// Build the full axum Router: health check, notification route, and the
/// WebSocket endpoint at the configured path.
pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/notify/{user_id}", post(notify::notify_user))
        .route("/health", get(health_check));

    ws::initialize(router, &state.ws.path).with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
