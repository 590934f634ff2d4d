//! Proxy-endpoint error types.
//!
//! Each kind maps to an `error_type` string in the JSON envelope returned
//! to clients; settlement failures never surface here.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, Clone)]
pub enum ProxyError {
    /// Missing, invalid, or revoked API key.
    Auth(String),
    /// No funding source passed the precheck.
    Quota(String),
    /// No channel serves the requested model.
    Routing(String),
    /// Transport failure, upstream 4xx/5xx, empty body, gate timeout.
    Upstream(String),
    /// Unparsable upstream frame or body.
    Translation(String),
    /// Store failure on the request path.
    Store(String),
    /// Invalid hot-reload payload.
    Config(String),
}

impl ProxyError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Auth(_) => "auth",
            ProxyError::Quota(_) => "quota",
            ProxyError::Routing(_) => "routing",
            ProxyError::Upstream(_) => "upstream",
            ProxyError::Translation(_) => "translation",
            ProxyError::Store(_) => "store",
            ProxyError::Config(_) => "config",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Auth(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Quota(_) => StatusCode::PAYMENT_REQUIRED,
            ProxyError::Routing(_) => StatusCode::NOT_FOUND,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Translation(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ProxyError::Auth(m)
            | ProxyError::Quota(m)
            | ProxyError::Routing(m)
            | ProxyError::Upstream(m)
            | ProxyError::Translation(m)
            | ProxyError::Store(m)
            | ProxyError::Config(m) => m,
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type(), self.message())
    }
}

impl std::error::Error for ProxyError {}

impl From<crate::error::AppError> for ProxyError {
    fn from(e: crate::error::AppError) -> Self {
        ProxyError::Store(e.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        crate::logger::warn(
            "dispatch",
            &format!(
                "Returning error: status={}, type={}, message={}",
                status.as_u16(),
                self.error_type(),
                self.message()
            ),
        );
        (
            status,
            Json(serde_json::json!({
                "error": {
                    "type": self.error_type(),
                    "message": self.message(),
                }
            })),
        )
            .into_response()
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
