//! HTTP error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors answered to a single request. They never affect other
/// subscribers.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request body is not a valid subscription request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The user could not be resolved
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        };
        let body = serde_json::json!({"error": self.to_string()});
        (status, axum::Json(body)).into_response()
    }
}

/// Errors bringing the server itself down.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound or serving failed
    #[error("http server: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for server operations.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;
