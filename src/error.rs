//! Error handling module
//!
//! Provides unified error types and handling for the entire application.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Duplicate proposal: {0}")]
    DuplicateProposal(String),

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Apply failed: {0}")]
    Apply(String),

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Stable machine-readable code, also used in audit details
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            AppError::DuplicateProposal(_) => "DUPLICATE_PROPOSAL",
            AppError::Expired(_) => "EXPIRED",
            AppError::Apply(_) => "APPLY_ERROR",
            AppError::Rollback(_) => "ROLLBACK_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Json(_) => "JSON_ERROR",
        }
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message, details) = match &self {
            AppError::Validation(msg) | AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), None)
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::QuotaExceeded(msg) => (StatusCode::TOO_MANY_REQUESTS, msg.clone(), None),
            AppError::DuplicateProposal(msg) => (StatusCode::CONFLICT, msg.clone(), None),
            AppError::Expired(msg) => (StatusCode::GONE, msg.clone(), None),
            AppError::Apply(msg) => {
                error!("Apply error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to apply configuration update".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Rollback(msg) => {
                error!("Rollback error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Rollback failed, manual intervention required".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Config(msg) => {
                error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A configuration error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
            AppError::Io(e) => {
                error!("I/O error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A filesystem error occurred".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Json(e) => (
                StatusCode::BAD_REQUEST,
                "Malformed JSON document".to_string(),
                Some(e.to_string()),
            ),
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> AppError {
    AppError::NotFound(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (validation_error("x"), StatusCode::BAD_REQUEST),
            (not_found_error("x"), StatusCode::NOT_FOUND),
            (AppError::QuotaExceeded("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (AppError::Expired("x".into()), StatusCode::GONE),
            (AppError::Rollback("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn test_io_error_converts() {
        let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
