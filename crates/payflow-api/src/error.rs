//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use payflow_core::error::DomainError;
use serde::Serialize;
use thiserror::Error;

/// Startup errors for the API server.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration is missing, malformed or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Redis connection error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP client construction failed.
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Tracing or metrics could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    /// Network binding or I/O error.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// JSON body returned for error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code.
    pub error: &'static str,
    /// Human-readable error message.
    pub message: String,
}

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A domain or store failure.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A mutating request arrived without an `Idempotency-Key` header.
    #[error("the Idempotency-Key header is required")]
    MissingIdempotencyKey,

    /// Another request with the same key is still executing.
    #[error("a request with this idempotency key is still in progress")]
    IdempotencyInProgress,

    /// The key was first used on a different endpoint.
    #[error("idempotency key was already used on {original}")]
    IdempotencyKeyReused {
        /// Endpoint of the original request.
        original: String,
    },
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Domain(DomainError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Domain(DomainError::Conflict(_)) => (StatusCode::CONFLICT, "conflict"),
            Self::Domain(DomainError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            Self::Domain(DomainError::Infrastructure(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "infrastructure_error")
            }
            Self::MissingIdempotencyKey => (StatusCode::BAD_REQUEST, "missing_idempotency_key"),
            Self::IdempotencyInProgress => (StatusCode::CONFLICT, "idempotency_in_progress"),
            Self::IdempotencyKeyReused { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "idempotency_key_reused")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: error_code,
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
