//! Record <-> stored payload conversion.
//!
//! Payloads are JSON text tagged by a single wrapper field: `{"sealed": envelope}`
//! for encrypted stores with an available encryptor, `{"plain": record}`
//! otherwise. The tag, not the record's shape, decides whether to decrypt, so a
//! plaintext record that looks like an envelope stays plaintext. Untagged
//! payloads are read by shape. Reads accept every form so stores can move
//! between them without a rewrite.

use crate::error::{StorageError, StorageResult};
use crate::schema::StoreSchema;
use haven_crypto::{DataEncryptor, RecordEnvelope};
use serde_json::{Map, Value};
use std::sync::Arc;

const SEALED_TAG: &str = "sealed";
const PLAIN_TAG: &str = "plain";

#[derive(Clone)]
pub struct RecordCodec {
    encryptor: Arc<dyn DataEncryptor>,
}

impl RecordCodec {
    pub fn new(encryptor: Arc<dyn DataEncryptor>) -> Self {
        Self { encryptor }
    }

    pub fn plaintext() -> Self {
        Self::new(Arc::new(haven_crypto::PassthroughEncryptor))
    }

    pub fn encrypts(&self, store: &StoreSchema) -> bool {
        store.encrypted && self.encryptor.is_available()
    }

    /// Serializes `record` for storage under primary key `key`.
    pub fn encode(&self, store: &StoreSchema, key: &Value, record: &Value) -> StorageResult<String> {
        if !self.encrypts(store) {
            return Ok(tagged(PLAIN_TAG, record.clone()).to_string());
        }
        let plaintext = serde_json::to_vec(record)?;
        let envelope = self.encryptor.seal(&envelope_id(key), &plaintext)?;
        Ok(tagged(SEALED_TAG, envelope.to_value()).to_string())
    }

    /// Parses a stored payload, opening it if it is sealed.
    pub fn decode(&self, payload: &str) -> StorageResult<Value> {
        let value: Value = serde_json::from_str(payload)?;
        match untag(value) {
            Stored::Plain(record) => Ok(record),
            Stored::Sealed(sealed) => {
                let envelope = RecordEnvelope::from_value(&sealed).ok_or_else(|| {
                    StorageError::InvalidOperation("sealed payload is not an envelope".into())
                })?;
                self.open(&envelope)
            }
            Stored::Untagged(value) => match RecordEnvelope::from_value(&value) {
                Some(envelope) => self.open(&envelope),
                None => Ok(value),
            },
        }
    }

    fn open(&self, envelope: &RecordEnvelope) -> StorageResult<Value> {
        let plaintext = self.encryptor.open(envelope).map_err(|e| {
            StorageError::InvalidOperation(format!("record {} could not be decrypted: {e}", envelope.id))
        })?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

enum Stored {
    Plain(Value),
    Sealed(Value),
    Untagged(Value),
}

fn tagged(tag: &str, inner: Value) -> Value {
    let mut wrapper = Map::with_capacity(1);
    wrapper.insert(tag.to_string(), inner);
    Value::Object(wrapper)
}

fn untag(value: Value) -> Stored {
    let Value::Object(mut fields) = value else {
        return Stored::Untagged(value);
    };
    if fields.len() == 1 {
        if let Some(record) = fields.remove(PLAIN_TAG) {
            return Stored::Plain(record);
        }
        if let Some(sealed) = fields.remove(SEALED_TAG) {
            return Stored::Sealed(sealed);
        }
    }
    Stored::Untagged(Value::Object(fields))
}

/// Envelope ids are the key itself for string keys, compact JSON otherwise.
fn envelope_id(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
