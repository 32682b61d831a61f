//! The `DataEncryptor` seam used by storage backends.
//!
//! Backends never hold key material directly. They ask an encryptor to seal or
//! open record envelopes; a locked or passthrough encryptor reports itself as
//! unavailable and the backend stores plaintext instead.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use crate::record::{open_record, seal_record, RecordEnvelope};
use std::sync::RwLock;

pub trait DataEncryptor: Send + Sync {
    /// Whether a key is loaded and sealing will succeed.
    fn is_available(&self) -> bool;

    /// Seals the serialized record `data` for `record_id`.
    fn seal(&self, record_id: &str, data: &[u8]) -> CryptoResult<RecordEnvelope>;

    /// Opens an envelope previously produced by `seal`.
    fn open(&self, envelope: &RecordEnvelope) -> CryptoResult<Vec<u8>>;
}

/// Encryptor holding a single record key that can be dropped on lock.
pub struct KeyedEncryptor {
    key: RwLock<Option<DerivedKey>>,
}

impl KeyedEncryptor {
    pub fn new(key: DerivedKey) -> Self {
        Self {
            key: RwLock::new(Some(key)),
        }
    }

    /// Starts locked; call [`KeyedEncryptor::unlock`] before writing.
    pub fn locked() -> Self {
        Self {
            key: RwLock::new(None),
        }
    }

    pub fn unlock(&self, key: DerivedKey) {
        let mut guard = self.key.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(key);
    }

    /// Drops (and zeroizes) the key.
    pub fn lock(&self) {
        let mut guard = self.key.write().unwrap_or_else(|p| p.into_inner());
        *guard = None;
    }

    fn with_key<T>(&self, f: impl FnOnce(&DerivedKey) -> CryptoResult<T>) -> CryptoResult<T> {
        let guard = self.key.read().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(key) => f(key),
            None => Err(CryptoError::Locked),
        }
    }
}

impl DataEncryptor for KeyedEncryptor {
    fn is_available(&self) -> bool {
        self.key
            .read()
            .map(|k| k.is_some())
            .unwrap_or(false)
    }

    fn seal(&self, record_id: &str, data: &[u8]) -> CryptoResult<RecordEnvelope> {
        self.with_key(|key| seal_record(key, record_id, data))
    }

    fn open(&self, envelope: &RecordEnvelope) -> CryptoResult<Vec<u8>> {
        self.with_key(|key| open_record(key, envelope))
    }
}

/// Stores everything in plaintext; cannot open envelopes.
pub struct PassthroughEncryptor;

impl DataEncryptor for PassthroughEncryptor {
    fn is_available(&self) -> bool {
        false
    }

    fn seal(&self, _record_id: &str, _data: &[u8]) -> CryptoResult<RecordEnvelope> {
        Err(CryptoError::Locked)
    }

    fn open(&self, _envelope: &RecordEnvelope) -> CryptoResult<Vec<u8>> {
        Err(CryptoError::Locked)
    }
}
