//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(#[from] cistern_storage::StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] cistern_metadata::MetadataError),

    #[error("filesystem error: {0}")]
    Fs(#[from] cistern_volumefs::FsError),

    #[error("crypto error: {0}")]
    Crypto(#[from] cistern_crypto::CryptoError),

    #[error("{0}")]
    Core(#[from] cistern_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Fs(e) => match e {
                cistern_volumefs::FsError::VolumeNotInitialized(_) => "volume_not_initialized",
                cistern_volumefs::FsError::NotFound(_) => "not_found",
                _ => "filesystem_error",
            },
            Self::Crypto(_) => "encryption_error",
            Self::Core(_) => "bad_request",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(e) => match e {
                cistern_storage::StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                cistern_metadata::MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                cistern_metadata::MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
                cistern_metadata::MetadataError::Constraint(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Fs(e) => match e {
                // Fresh volumes are initialized by their first mount; the
                // file API is unavailable until then.
                cistern_volumefs::FsError::VolumeNotInitialized(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                cistern_volumefs::FsError::NotFound(_) => StatusCode::NOT_FOUND,
                cistern_volumefs::FsError::InvalidPath(_) => StatusCode::BAD_REQUEST,
                cistern_volumefs::FsError::NotADirectory(_)
                | cistern_volumefs::FsError::IsADirectory(_)
                | cistern_volumefs::FsError::DirectoryNotEmpty(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
