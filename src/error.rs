use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Error taxonomy of the HTTP surface. Variants carry the user-facing
/// message; the status mapping is fixed per variant.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The caller omitted (or malformed) a required field.
    #[error("{0}")]
    MissingParameter(String),

    /// A referenced chat or message does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The generation service was unreachable or returned a failure.
    #[error("{0:#}")]
    Upstream(anyhow::Error),

    /// A record-store operation or other internal step failed.
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn chat_not_found() -> Self {
        ApiError::NotFound("chat not found".to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

// JSON `{message}` body, matching what the client's error-normalizing
// path extracts.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed: {:#}", self);
        }
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}
