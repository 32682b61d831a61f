//! The storage contract and its three implementations.
//!
//! Each backend keeps its blocking engine (DuckDB, SQLite, a key-value area)
//! behind one `Mutex` and runs every call on the blocking pool, so operations
//! on the same backend never interleave.

pub mod kv;
pub mod object_store;
pub mod relational;

use crate::backup::StorageBackup;
use crate::config::BackendKind;
use crate::error::{StorageError, StorageResult};
use crate::key_codec;
use crate::key_path;
use crate::metrics::{StorageMetrics, StoreMetrics};
use crate::operation::{OperationResult, StorageOperation};
use crate::query::{Collector, Direction, EncodedRange, StorageQuery};
use crate::schema::{StorageSchema, StoreIndex, StoreSchema};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Whether a multi-operation transaction rolls back on failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionSupport {
    /// Any failure undoes every prior operation of the transaction.
    Atomic,
    /// Operations apply one by one; earlier effects survive a later failure.
    BestEffort,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn transaction_support(&self) -> TransactionSupport;

    /// Provisions stores and indexes, migrating additively from the persisted
    /// schema when `schema.version` is higher.
    async fn initialize(&self, schema: &StorageSchema) -> StorageResult<()>;

    /// The effective schema after initialization.
    fn schema(&self) -> StorageResult<Arc<StorageSchema>>;

    async fn create(&self, store: &str, value: Value) -> StorageResult<Value>;

    async fn read(&self, store: &str, key: &Value) -> StorageResult<Option<Value>>;

    async fn update(&self, store: &str, key: &Value, value: Value) -> StorageResult<Value>;

    async fn delete(&self, store: &str, key: &Value) -> StorageResult<()>;

    async fn query(&self, query: &StorageQuery) -> StorageResult<Vec<Value>>;

    async fn transaction(
        &self,
        operations: Vec<StorageOperation>,
    ) -> StorageResult<Vec<OperationResult>>;

    /// Every decryptable record of a store, in primary-key order.
    async fn dump_store(&self, store: &str) -> StorageResult<Vec<Value>>;

    /// Clears a store and repopulates it with `records`.
    async fn replace_store(&self, store: &str, records: Vec<Value>) -> StorageResult<()>;

    async fn store_metrics(&self, store: &str, sample_size: usize) -> StorageResult<StoreMetrics>;

    async fn clear_store(&self, store: &str) -> StorageResult<()>;

    async fn backup(&self, user_id: &str) -> StorageResult<StorageBackup> {
        let schema = self.schema()?;
        let mut backup = StorageBackup::new(user_id, schema.version);
        for store in &schema.stores {
            let records = self.dump_store(&store.name).await?;
            backup.data.insert(store.name.clone(), records);
        }
        info!(
            backup_id = %backup.id,
            records = backup.record_count(),
            "storage backup created"
        );
        Ok(backup)
    }

    /// Restores store by store. Unknown stores fail before anything is touched.
    async fn restore(&self, backup: &StorageBackup) -> StorageResult<()> {
        let schema = self.schema()?;
        for name in backup.data.keys() {
            schema.require_store(name)?;
        }
        for (name, records) in &backup.data {
            debug!(store = %name, records = records.len(), "restoring store");
            self.replace_store(name, records.clone()).await?;
        }
        info!(backup_id = %backup.id, "storage backup restored");
        Ok(())
    }

    async fn metrics(&self, sample_size: usize) -> StorageResult<StorageMetrics> {
        let schema = self.schema()?;
        let mut per_store = Vec::with_capacity(schema.stores.len());
        for store in &schema.stores {
            let metrics = self.store_metrics(&store.name, sample_size).await?;
            per_store.push((store.name.clone(), metrics));
        }
        Ok(per_store.into_iter().collect())
    }

    async fn clear_all(&self) -> StorageResult<()> {
        let schema = self.schema()?;
        for store in &schema.stores {
            self.clear_store(&store.name).await?;
        }
        Ok(())
    }
}

/// The schema a backend was initialized with; `None` until `initialize`.
#[derive(Default)]
pub(crate) struct SchemaState(RwLock<Option<Arc<StorageSchema>>>);

impl SchemaState {
    pub(crate) fn get(&self) -> StorageResult<Arc<StorageSchema>> {
        let guard = self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone().ok_or_else(StorageError::not_initialized)
    }

    pub(crate) fn set(&self, schema: StorageSchema) {
        let mut guard = self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(Arc::new(schema));
    }

    pub(crate) fn store(&self, name: &str) -> StorageResult<StoreSchema> {
        self.get()?.require_store(name).cloned()
    }
}

/// Runs blocking engine work for `state` on the blocking pool.
pub(crate) async fn run_blocking<S, T, F>(state: &Arc<S>, f: F) -> StorageResult<T>
where
    S: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> StorageResult<T> + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(&state)).await?
}

/// Decides which schema to persist given what is already stored.
///
/// Returns `None` when nothing changes (same version), the diff to apply on an
/// upgrade, and a schema error on a downgrade.
pub(crate) fn plan_migration(
    persisted: Option<StorageSchema>,
    requested: &StorageSchema,
) -> StorageResult<Migration> {
    requested.validate()?;
    let Some(old) = persisted else {
        return Ok(Migration::Fresh(requested.clone()));
    };
    if requested.version < old.version {
        return Err(StorageError::Schema(format!(
            "schema '{}' is at version {}, cannot open with older version {}",
            old.name, old.version, requested.version
        )));
    }
    if requested.version == old.version {
        return Ok(Migration::Unchanged(old));
    }
    let diff = requested.additions_since(&old)?;
    Ok(Migration::Upgrade {
        from: old.version,
        schema: requested.merged_with(&old),
        diff,
    })
}

pub(crate) enum Migration {
    Fresh(StorageSchema),
    Unchanged(StorageSchema),
    Upgrade {
        from: u32,
        schema: StorageSchema,
        diff: crate::schema::SchemaDiff,
    },
}

/// A record ready to be written: its key, encoded key and final value.
pub(crate) struct PreparedRecord {
    pub key: Value,
    pub encoded_key: String,
    pub record: Value,
}

/// Assigns or validates the primary key of a record about to be created.
pub(crate) fn prepare_create(store: &StoreSchema, mut record: Value) -> StorageResult<PreparedRecord> {
    if !record.is_object() {
        return Err(StorageError::InvalidOperation(format!(
            "records in '{}' must be objects",
            store.name
        )));
    }
    let key = match key_path::get(&record, &store.key_path).filter(|v| !v.is_null()) {
        Some(key) => key.clone(),
        None if store.auto_generate => {
            let key = Value::String(uuid::Uuid::now_v7().to_string());
            key_path::set(&mut record, &store.key_path, key.clone())?;
            key
        }
        None => {
            return Err(StorageError::InvalidOperation(format!(
                "record for '{}' has no '{}' and the store does not generate keys",
                store.name, store.key_path
            )));
        }
    };
    let encoded_key = key_codec::encode_primary_key(&key)?;
    Ok(PreparedRecord { key, encoded_key, record })
}

/// Forces the record's key path to `key` for a full-replace update.
pub(crate) fn prepare_update(
    store: &StoreSchema,
    key: &Value,
    mut record: Value,
) -> StorageResult<PreparedRecord> {
    if !record.is_object() {
        return Err(StorageError::InvalidOperation(format!(
            "records in '{}' must be objects",
            store.name
        )));
    }
    let encoded_key = key_codec::encode_primary_key(key)?;
    key_path::set(&mut record, &store.key_path, key.clone())?;
    Ok(PreparedRecord {
        key: key.clone(),
        encoded_key,
        record,
    })
}

/// Primary key of a record being restored; restored records must carry one.
pub(crate) fn restored_key(store: &StoreSchema, record: &Value) -> StorageResult<(Value, String)> {
    let key = key_path::get(record, &store.key_path)
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| {
            StorageError::InvalidOperation(format!(
                "backup record for '{}' has no '{}'",
                store.name, store.key_path
            ))
        })?;
    let encoded = key_codec::encode_primary_key(&key)?;
    Ok((key, encoded))
}

/// Range selection over decrypted records, for indexes the engine cannot scan.
///
/// `records` are (encoded primary key, record) pairs. With no index the range
/// applies to the primary key. Multi-entry indexes yield a record once per
/// matching element, like a cursor over the index would.
pub(crate) fn select_in_memory(
    records: Vec<(String, Value)>,
    index: Option<&StoreIndex>,
    range: &EncodedRange,
    query: &StorageQuery,
) -> Vec<Value> {
    let mut matches: Vec<(String, String, Value)> = Vec::new();
    for (pk, record) in records {
        let keys = match index {
            Some(index) => key_codec::index_keys(&record, index),
            None => vec![pk.clone()],
        };
        for key in keys.into_iter().filter(|k| range.contains(k)) {
            matches.push((key, pk.clone(), record.clone()));
        }
    }
    matches.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
    if query.direction == Direction::Prev {
        matches.reverse();
    }
    let mut collector = Collector::new(query);
    for (_, _, record) in matches {
        if !collector.push(record) {
            break;
        }
    }
    collector.finish()
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
