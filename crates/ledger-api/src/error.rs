//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ledger_firestore::FirestoreError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Firestore error: {0}")]
    Firestore(#[from] FirestoreError),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Firestore(e) => match e {
                FirestoreError::Validation(_) => StatusCode::BAD_REQUEST,
                FirestoreError::NotFound(_) => StatusCode::NOT_FOUND,
                FirestoreError::AlreadyExists(_) => StatusCode::CONFLICT,
                e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) | ApiError::Validation(_) => "INVALID_INPUT",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Internal(_) => "INTERNAL",
            ApiError::Firestore(FirestoreError::Validation(_)) => "INVALID_INPUT",
            ApiError::Firestore(FirestoreError::NotFound(_)) => "NOT_FOUND",
            ApiError::Firestore(FirestoreError::AlreadyExists(_)) => "ALREADY_EXISTS",
            ApiError::Firestore(_) => "STORE_FAILURE",
        }
    }

    /// Whether the message may carry store internals.
    fn is_internal(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't expose internal error details in production
        let error = if self.is_internal()
            && std::env::var("ENVIRONMENT").unwrap_or_default() == "production"
        {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            success: false,
            error,
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firestore_errors_map_to_statuses() {
        let cases = [
            (FirestoreError::validation("bad path"), StatusCode::BAD_REQUEST),
            (FirestoreError::AlreadyExists("coupons/X".into()), StatusCode::CONFLICT),
            (FirestoreError::ServerError(503, "down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (FirestoreError::AtomicTransform("gave up".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ApiError::unauthorized("x").code(), "UNAUTHORIZED");
        assert_eq!(
            ApiError::from(FirestoreError::AlreadyExists("x".into())).code(),
            "ALREADY_EXISTS"
        );
        assert_eq!(
            ApiError::from(FirestoreError::ServerError(500, "x".into())).code(),
            "STORE_FAILURE"
        );
    }
}
