//! Error types for InfluenceMapper services
//!
//! One `AppError` for every crate, with a numeric `ErrorCode`, an HTTP
//! status and a JSON body of the form `{ "error": { code, message } }`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Machine-readable error identification, grouped in numeric families
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request errors (1xxx)
    ValidationError,
    InvalidFormat,
    PayloadTooLarge,

    // Unknown sessions and bundles (4xxx)
    SessionNotFound,
    BundleNotFound,

    // Conflicts (5xxx)
    SessionConflict,

    // Rate limiting (6xxx)
    RateLimited,

    // External services (8xxx)
    UpstreamError,
    InferenceError,
    InferenceTimeout,
    TransportError,
    RegistryError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidFormat => 1003,
            ErrorCode::PayloadTooLarge => 1004,

            ErrorCode::SessionNotFound => 4002,
            ErrorCode::BundleNotFound => 4003,

            ErrorCode::SessionConflict => 5002,

            ErrorCode::RateLimited => 6001,

            ErrorCode::UpstreamError => 8001,
            ErrorCode::InferenceError => 8002,
            ErrorCode::InferenceTimeout => 8003,
            ErrorCode::TransportError => 8004,
            ErrorCode::RegistryError => 8005,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Upload and request errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    #[error("Upload exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    // Session lifecycle
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("Bundle not found: {name}")]
    BundleNotFound { name: String },

    #[error("Session conflict for {id}: {message}")]
    SessionConflict { id: String, message: String },

    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // External services
    #[error("Inference service error: {message}")]
    Inference { message: String },

    #[error("Inference timeout after {timeout_ms}ms")]
    InferenceTimeout { timeout_ms: u64 },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Session registry error: {message}")]
    Registry { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            AppError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            AppError::BundleNotFound { .. } => ErrorCode::BundleNotFound,
            AppError::SessionConflict { .. } => ErrorCode::SessionConflict,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Inference { .. } => ErrorCode::InferenceError,
            AppError::InferenceTimeout { .. } => ErrorCode::InferenceTimeout,
            AppError::Transport { .. } => ErrorCode::TransportError,
            AppError::Registry { .. } => ErrorCode::RegistryError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } |
            AppError::InvalidFormat { .. } => StatusCode::BAD_REQUEST,

            AppError::SessionNotFound { .. } |
            AppError::BundleNotFound { .. } => StatusCode::NOT_FOUND,

            AppError::SessionConflict { .. } => StatusCode::CONFLICT,

            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            AppError::Internal { .. } |
            AppError::Configuration { .. } |
            AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,

            AppError::Inference { .. } |
            AppError::InferenceTimeout { .. } |
            AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            AppError::Transport { .. } |
            AppError::Registry { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether retrying the same inference call could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::InferenceTimeout { .. } |
            AppError::Inference { .. } |
            AppError::Transport { .. } => true,
            AppError::HttpClient(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let details = match &self {
            AppError::Validation { field: Some(field), .. } => {
                Some(serde_json::json!({ "field": field }))
            }
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string()
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Registry {
            message: err.to_string()
        }
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::InvalidFormat {
            message: err.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::SessionNotFound { id: "test".into() };
        assert_eq!(err.code(), ErrorCode::SessionNotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code().as_code(), 4002);
    }

    #[test]
    fn test_validation_error() {
        let err = AppError::Validation {
            message: "Empty title".into(),
            field: Some("Title".into()),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code().as_code(), 1001);
    }

    #[test]
    fn test_session_conflict_is_client_error() {
        let err = AppError::SessionConflict {
            id: "abc".into(),
            message: "already collecting".into(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_oversized_upload_maps_to_413() {
        let err = AppError::PayloadTooLarge { limit: 1024 };
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(err.code(), ErrorCode::PayloadTooLarge);
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::InferenceTimeout { timeout_ms: 10 }.is_transient());
        assert!(!AppError::Internal { message: "bug".into() }.is_transient());
        assert!(!AppError::InvalidFormat { message: "x".into() }.is_transient());
    }

    #[test]
    fn test_csv_error_maps_to_invalid_format() {
        let data = "a,b\n1,2,3\n";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let err = reader
            .records()
            .find_map(|r| r.err())
            .map(AppError::from)
            .unwrap();
        assert_eq!(err.code(), ErrorCode::InvalidFormat);
    }
}
