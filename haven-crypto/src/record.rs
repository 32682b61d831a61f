//! Per-record envelopes: `{ id, encryptedPayload, iv }`.
//!
//! The payload and IV are base64 (standard alphabet). The record id is bound
//! as associated data, so an envelope only opens under the id it was sealed for.

use crate::cipher::{decrypt_with_aad, encrypt_with_aad, EncryptedData, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Encrypted stand-in for a plaintext record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEnvelope {
    pub id: String,
    pub encrypted_payload: String,
    pub iv: String,
}

impl RecordEnvelope {
    /// Recognizes the envelope shape: an object with exactly `id`,
    /// `encryptedPayload` and `iv`, all strings.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 3 {
            return None;
        }
        Some(Self {
            id: obj.get("id")?.as_str()?.to_string(),
            encrypted_payload: obj.get("encryptedPayload")?.as_str()?.to_string(),
            iv: obj.get("iv")?.as_str()?.to_string(),
        })
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "encryptedPayload": self.encrypted_payload,
            "iv": self.iv,
        })
    }

    fn encrypted_data(&self) -> CryptoResult<EncryptedData> {
        let iv = STANDARD
            .decode(&self.iv)
            .map_err(|e| CryptoError::Encoding(format!("iv: {e}")))?;
        if iv.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: iv.len(),
            });
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&iv);
        let ciphertext = STANDARD
            .decode(&self.encrypted_payload)
            .map_err(|e| CryptoError::Encoding(format!("payload: {e}")))?;
        Ok(EncryptedData { nonce, ciphertext })
    }
}

/// Returns true if `value` has the envelope shape.
pub fn is_envelope(value: &serde_json::Value) -> bool {
    RecordEnvelope::from_value(value).is_some()
}

/// Seals raw record bytes for the record `id`.
pub fn seal_record(key: &DerivedKey, id: &str, plaintext: &[u8]) -> CryptoResult<RecordEnvelope> {
    let sealed = encrypt_with_aad(key, plaintext, id.as_bytes())?;
    Ok(RecordEnvelope {
        id: id.to_string(),
        encrypted_payload: STANDARD.encode(&sealed.ciphertext),
        iv: STANDARD.encode(sealed.nonce),
    })
}

/// Opens an envelope produced by [`seal_record`].
pub fn open_record(key: &DerivedKey, envelope: &RecordEnvelope) -> CryptoResult<Vec<u8>> {
    let data = envelope.encrypted_data()?;
    decrypt_with_aad(key, &data, envelope.id.as_bytes())
}

/// Seals a JSON value.
pub fn seal_value(key: &DerivedKey, id: &str, value: &serde_json::Value) -> CryptoResult<RecordEnvelope> {
    let bytes = serde_json::to_vec(value)?;
    seal_record(key, id, &bytes)
}

/// Opens an envelope back into a JSON value.
pub fn open_value(key: &DerivedKey, envelope: &RecordEnvelope) -> CryptoResult<serde_json::Value> {
    let bytes = open_record(key, envelope)?;
    Ok(serde_json::from_slice(&bytes)?)
}
