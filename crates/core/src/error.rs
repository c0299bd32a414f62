//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid volume name: {0}")]
    InvalidVolumeName(String),

    #[error("invalid volume id: {0}")]
    InvalidVolumeId(String),

    #[error("invalid mount path: {0}")]
    InvalidMountPath(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
