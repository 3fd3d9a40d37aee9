//! # Error Handling
//!
//! HTTP-facing error type for the relay's REST endpoints and the WebSocket upgrade.
//! Errors local to one chunk or one playback buffer live next to the code that raises
//! them (`relay::generation`, `relay::retry`, `client::*`) and never reach this type.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Chunk size must be greater than 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Errors returned from HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Client sent malformed data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Input parsed but broke a validation rule
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Capacity reached (e.g. concurrent session limit)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::ValidationError(_) => "validation_error",
            AppError::ServiceUnavailable(_) => "service_unavailable",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::BadRequest(msg)
            | AppError::ValidationError(msg)
            | AppError::ServiceUnavailable(msg) => msg,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// JSON problems are almost always the caller's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
