//! Volume filesystem error types.

use thiserror::Error;

/// Errors from the out-of-band filesystem client.
#[derive(Debug, Error)]
pub enum FsError {
    /// The volume has no metadata snapshot yet. Fresh volumes are
    /// initialized by their first mount; until then file operations are
    /// unavailable.
    #[error("volume not initialized: {0}")]
    VolumeNotInitialized(String),

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("volume metadata is not a recognized filesystem: {0}")]
    InvalidMetadata(String),

    #[error("client closed")]
    Closed,

    #[error("{tool} failed with {status}: {stderr}")]
    Subprocess {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("{tool} timed out after {seconds}s")]
    SubprocessTimeout { tool: &'static str, seconds: u64 },

    #[error("metadata database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage error: {0}")]
    Storage(#[from] cistern_storage::StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for volume filesystem operations.
pub type FsResult<T> = std::result::Result<T, FsError>;
