//! Encryption-at-rest layer for Haven.
//!
//! Every record written by the storage backends can be sealed into an
//! envelope using:
//! - ChaCha20-Poly1305 for authenticated encryption, one fresh nonce per record
//! - Argon2id for deriving keys from a user secret
//! - Zeroization of key material on drop
//!
//! # Layers
//!
//! 1. [`cipher`] seals raw bytes and fails closed on tag mismatch.
//! 2. [`record`] wraps that into the `{ id, encryptedPayload, iv }` envelope
//!    stored in place of plaintext records.
//! 3. [`password`] seals whole objects (exported backups) under a password,
//!    keeping the salt beside the ciphertext.
//! 4. [`encryptor`] is the trait the storage crate talks to.

pub mod cipher;
pub mod encryptor;
mod error;
mod key;
pub mod password;
pub mod record;

pub use cipher::{
    decrypt, decrypt_string, decrypt_with_aad, encrypt, encrypt_string, encrypt_with_aad,
    EncryptedData, NONCE_SIZE, TAG_SIZE,
};
pub use encryptor::{DataEncryptor, KeyedEncryptor, PassthroughEncryptor};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_key, generate_random_key, DerivedKey, KdfParams, Salt, KEY_SIZE, SALT_SIZE};
pub use password::{open_with_password, seal_with_password, PasswordSealed};
pub use record::{is_envelope, open_record, open_value, seal_record, seal_value, RecordEnvelope};
