//! Errors returned by HTTP handlers, rendered as `{"error": "..."}` JSON.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Body was not valid JSON or had the wrong shape
    #[error("invalid request body: {0}")]
    MalformedBody(String),
    #[error("both title and body must be provided")]
    MissingFields,
    /// Recipient has no open registered connection
    #[error("user '{0}' is not currently connected")]
    NotConnected(String),
    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedBody(_) | Self::MissingFields => StatusCode::BAD_REQUEST,
            Self::NotConnected(_) => StatusCode::NOT_FOUND,
            Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
