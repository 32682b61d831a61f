//! ChaCha20-Poly1305 authenticated encryption with a fresh nonce per call.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Nonce (IV) size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Ciphertext together with the nonce it was sealed under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Nonce followed by ciphertext, the compact wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption(format!(
                "ciphertext too short ({} bytes)",
                bytes.len()
            )));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }
}

/// Encrypts `plaintext` under `key` with a newly generated nonce.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedData { nonce, ciphertext })
}

/// Decrypts and authenticates. Never returns unauthenticated plaintext.
pub fn decrypt(key: &DerivedKey, data: &EncryptedData) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(&data.nonce), data.ciphertext.as_ref())
        .map_err(|_| {
            CryptoError::Decryption("authentication failed (wrong key or tampered data)".to_string())
        })
}

/// Encrypts with associated data that must be presented again on decryption.
///
/// Record envelopes bind the record id this way so a sealed payload cannot be
/// swapped onto another record.
pub fn encrypt_with_aad(key: &DerivedKey, plaintext: &[u8], aad: &[u8]) -> CryptoResult<EncryptedData> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedData { nonce, ciphertext })
}

/// Counterpart of [`encrypt_with_aad`].
pub fn decrypt_with_aad(key: &DerivedKey, data: &EncryptedData, aad: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(&data.nonce),
            Payload {
                msg: data.ciphertext.as_ref(),
                aad,
            },
        )
        .map_err(|_| {
            CryptoError::Decryption("authentication failed (wrong key, id or tampered data)".to_string())
        })
}

/// Encrypts a UTF-8 string.
pub fn encrypt_string(key: &DerivedKey, plaintext: &str) -> CryptoResult<EncryptedData> {
    encrypt(key, plaintext.as_bytes())
}

/// Decrypts into a UTF-8 string.
pub fn decrypt_string(key: &DerivedKey, data: &EncryptedData) -> CryptoResult<String> {
    let bytes = decrypt(key, data)?;
    String::from_utf8(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))
}
