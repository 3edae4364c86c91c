//! Error types for sqal-fusion
//!
//! Layer errors (`ValidationError`, `FusionError`) are mapped onto HTTP status
//! codes here; handlers just use `?`.

use crate::fusion::FusionError;
use crate::ingest::ValidationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Frame refused at ingestion (400)
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Malformed request parameter (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Request conflicts with the sample's state (409)
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<FusionError> for ApiError {
    fn from(err: FusionError) -> Self {
        match err {
            FusionError::UnknownSample(_) => ApiError::NotFound(err.to_string()),
            FusionError::NoData(_) | FusionError::Discarded(_) | FusionError::Cancelled(_) => {
                ApiError::Conflict(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::Validation(ref err) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", err.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
