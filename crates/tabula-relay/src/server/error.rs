//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::session::SessionError;

/// Errors returned by the JSON endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Session(e) => session_status(e),
        }
    }

    const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::UpstreamUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Session(SessionError::NotFound(_)) => "SESSION_NOT_FOUND",
            Self::Session(SessionError::AlreadyAttached(_)) => "SESSION_BUSY",
            Self::Session(SessionError::IdExhausted) => "INTERNAL_ERROR",
        }
    }
}

/// Status code for a session lookup failure.
pub const fn session_status(error: &SessionError) -> StatusCode {
    match error {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::AlreadyAttached(_) => StatusCode::CONFLICT,
        SessionError::IdExhausted => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}
