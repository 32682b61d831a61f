//! Error types for the encryption layer.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur while deriving keys or sealing/opening data.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Authentication tag mismatch, wrong key, or tampered ciphertext.
    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("encryptor is locked")]
    Locked,
}
