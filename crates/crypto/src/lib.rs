//! Symmetric encryption utilities for sensitive data.
//!
//! This crate provides:
//! - AES-256-GCM encryption and decryption of stored secrets
//! - Key and password generation

pub mod encryptor;
pub mod error;

pub use encryptor::{Encryptor, generate_key, generate_password};
pub use error::{CryptoError, CryptoResult};
