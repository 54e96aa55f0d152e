use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Operation not valid for the current negotiation state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Routing could not bind a consumer (no live producer or incompatible capabilities)
    #[error("cannot consume")]
    CannotConsume,

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidState(_) | AppError::CannotConsume => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message relayed to signaling clients in an `{error}` payload
    pub fn signaling_message(&self) -> String {
        match self {
            // Clients match on this exact string
            AppError::CannotConsume => "cannot consume".to_string(),
            AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::InvalidState(msg)
            | AppError::Engine(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cannot_consume_message() {
        assert_eq!(AppError::CannotConsume.signaling_message(), "cannot consume");
        assert_eq!(AppError::CannotConsume.to_string(), "cannot consume");
    }

    #[test]
    fn test_signaling_message_strips_prefix() {
        let err = AppError::InvalidState("transport not connected".to_string());
        assert_eq!(err.signaling_message(), "transport not connected");
        assert_eq!(err.to_string(), "Invalid state: transport not connected");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::CannotConsume.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            AppError::Engine("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
