//! Key material and password-based key derivation (Argon2id).

use crate::error::{CryptoError, CryptoResult};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a symmetric key in bytes (ChaCha20-Poly1305).
pub const KEY_SIZE: usize = 32;

/// Size of a KDF salt in bytes.
pub const SALT_SIZE: usize = 16;

/// A 256-bit symmetric key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Builds a key from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut out = [0u8; KEY_SIZE];
        out.copy_from_slice(bytes);
        Ok(Self { bytes: out })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Random salt fed to the KDF; stored next to whatever it protects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Generates a fresh random salt.
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP baseline for Argon2id
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and low-end devices. Not for production secrets.
    pub fn low_cost() -> Self {
        Self {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Derives a key from a password with Argon2id.
pub fn derive_key(password: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<DerivedKey> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut out = [0u8; KEY_SIZE];
    argon
        .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let key = DerivedKey::from_bytes(out);
    out.zeroize();
    Ok(key)
}

/// Generates a random key (for record keys that are not password-derived).
pub fn generate_random_key() -> DerivedKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut bytes);
    let key = DerivedKey::from_bytes(bytes);
    bytes.zeroize();
    key
}
