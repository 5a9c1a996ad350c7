//! Notification-producing route: pushes a `{title, body}` payload to one
//! user's registered WebSocket connection.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Wire format written to the recipient's socket.
#[derive(Debug, Serialize)]
pub struct Notification<'a> {
    pub title: &'a str,
    pub body: &'a str,
}

/// POST /notify/{user_id} — Deliver a notification to a connected user.
/// Body: { "title": "...", "body": "..." }
/// 200 when queued for the user, 404 when the user is not connected,
/// 400 when title/body are missing or the body is not JSON.
pub async fn notify_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::MalformedBody(e.body_text()))?;

    let title = req.title.as_deref().filter(|t| !t.is_empty());
    let body = req.body.as_deref().filter(|b| !b.is_empty());
    let (Some(title), Some(body)) = (title, body) else {
        return Err(ApiError::MissingFields);
    };

    let message = serde_json::to_string(&Notification { title, body })?;

    if state.registry.send_to_user(&user_id, message) {
        Ok(Json(serde_json::json!({
            "message": format!("notification delivered to '{}'", user_id),
        })))
    } else {
        Err(ApiError::NotConnected(user_id))
    }
}
