//! Crypto error types.

use thiserror::Error;

/// Encryption operation errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("decode encryption key: {0}")]
    KeyDecode(String),

    #[error("encryption key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("ciphertext too short")]
    CiphertextTooShort,

    #[error("decrypt: authentication failed")]
    Decrypt,
}

/// Result type for crypto operations.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;
