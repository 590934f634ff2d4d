//! Unified error types for the admin surface.
//!
//! Proxy-endpoint errors live in `forward::error`; this type covers the
//! `/api` collaborator surface and internal store plumbing.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

/// Application-wide error type for store and admin operations.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(e) => {
                crate::logger::error("store", &format!("Database error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "Database operation failed".to_string())
            }
            AppError::Io(e) => {
                crate::logger::error("server", &format!("IO error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "File operation failed".to_string())
            }
            AppError::Json(e) => {
                crate::logger::error("server", &format!("JSON error: {}", e));
                (StatusCode::BAD_REQUEST, "Invalid JSON payload".to_string())
            }
            AppError::Config(msg) => {
                crate::logger::error("config", &format!("Config error: {}", msg));
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => {
                crate::logger::error("server", &format!("Internal error: {}", msg));
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Result type alias for app operations.
pub type AppResult<T> = Result<T, AppError>;
