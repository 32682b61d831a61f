//! Backups: a full plaintext snapshot of every store.

use crate::error::{StorageError, StorageResult};
use haven_crypto::{open_with_password, seal_with_password, KdfParams, PasswordSealed};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Decrypted snapshot of a database. Restore consumes it store by store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBackup {
    pub id: String,
    pub user_id: String,
    /// Creation time, unix milliseconds.
    pub timestamp: i64,
    pub schema_version: u32,
    pub data: BTreeMap<String, Vec<Value>>,
}

impl StorageBackup {
    pub fn new(user_id: impl Into<String>, schema_version: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            schema_version,
            data: BTreeMap::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }

    pub fn to_json(&self) -> StorageResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> StorageResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A backup sealed under a password for export off the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedBackup {
    pub backup_id: String,
    pub sealed: PasswordSealed,
}

impl SealedBackup {
    pub fn seal(backup: &StorageBackup, password: &str, params: &KdfParams) -> StorageResult<Self> {
        let plaintext = serde_json::to_vec(backup)?;
        Ok(Self {
            backup_id: backup.id.clone(),
            sealed: seal_with_password(password, &plaintext, params)?,
        })
    }

    pub fn open(&self, password: &str) -> StorageResult<StorageBackup> {
        let plaintext = open_with_password(password, &self.sealed)?;
        let backup: StorageBackup = serde_json::from_slice(&plaintext)?;
        if backup.id != self.backup_id {
            return Err(StorageError::InvalidOperation(format!(
                "sealed backup {} contains backup {}",
                self.backup_id, backup.id
            )));
        }
        Ok(backup)
    }
}
