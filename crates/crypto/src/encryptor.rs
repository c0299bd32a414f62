//! AES-256-GCM encryptor for per-volume secret material.

use crate::error::{CryptoError, CryptoResult};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

/// AES-GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;

/// Required key size in bytes (256 bits).
const KEY_SIZE: usize = 32;

/// Authenticated symmetric encryption with a 256-bit key.
///
/// Output layout is `nonce || ciphertext || tag`; the nonce is fresh random
/// per call.
pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl Encryptor {
    /// Create an encryptor from a base64-encoded key.
    ///
    /// Fails unless the decoded key is exactly 32 bytes.
    pub fn new(key_base64: &str) -> CryptoResult<Self> {
        let key_bytes = STANDARD
            .decode(key_base64)
            .map_err(|e| CryptoError::KeyDecode(e.to_string()))?;

        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::KeyLength(key_bytes.len()));
        }

        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt plaintext, returning the nonce prepended to the sealed bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Decrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt ciphertext produced by [`Encryptor::encrypt`].
    ///
    /// Rejects inputs shorter than the nonce and any tampered payload.
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CryptoError::CiphertextTooShort);
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decrypt)
    }
}

/// Generate a fresh 256-bit key as a standard base64 string.
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    STANDARD.encode(key)
}

/// Generate a random password: 32 random bytes, URL-safe base64 without
/// padding.
pub fn generate_password() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
