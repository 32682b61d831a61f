//! Key-value fallback backend.
//!
//! For environments without an embedded database. Records live as payload
//! strings in a flat, ordered key-value area; indexes are evaluated in memory
//! over decrypted records. Unique indexes additionally keep one entry per
//! index key pointing at its owner's primary key, so uniqueness checks never
//! scan the store. Every write is one batch, so the quota check either admits
//! a whole batch or rejects it untouched.

use super::{
    plan_migration, prepare_create, prepare_update, restored_key, run_blocking, select_in_memory,
    Migration, SchemaState, StorageBackend, TransactionSupport,
};
use crate::codec::RecordCodec;
use crate::config::{BackendKind, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::key_codec;
use crate::metrics::StoreMetrics;
use crate::operation::{OperationResult, StorageOperation};
use crate::query::StorageQuery;
use crate::schema::{StorageSchema, StoreIndex, StoreSchema};
use async_trait::async_trait;
use haven_crypto::DataEncryptor;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

const SEP: char = '\u{1f}';

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvWrite {
    Put(String, String),
    Remove(String),
}

/// An ordered string key-value area.
pub trait KeyValueArea: Send {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>>;

    /// Applies all writes or none.
    fn write_batch(&mut self, batch: Vec<KvWrite>) -> StorageResult<()>;

    /// Bytes currently held (keys plus values).
    fn used_bytes(&self) -> u64;
}

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// Previous value of each key a batch touched, in write order.
type UndoLog = Vec<(String, Option<String>)>;

/// Size of the area after `batch`, computed from the touched keys only.
fn projected_size(entries: &BTreeMap<String, String>, used: u64, batch: &[KvWrite]) -> u64 {
    let mut pending: HashMap<&str, Option<usize>> = HashMap::new();
    let mut size = i128::from(used);
    for write in batch {
        let (key, new_len) = match write {
            KvWrite::Put(k, v) => (k.as_str(), Some(v.len())),
            KvWrite::Remove(k) => (k.as_str(), None),
        };
        let old_len = match pending.get(key) {
            Some(len) => *len,
            None => entries.get(key).map(String::len),
        };
        let entry = |len: usize| (key.len() + len) as i128;
        size += new_len.map_or(0, entry) - old_len.map_or(0, entry);
        pending.insert(key, new_len);
    }
    size.max(0) as u64
}

/// Applies `batch` in place if the result fits `quota`. Returns the new size
/// and the log needed to undo it.
fn apply_batch(
    entries: &mut BTreeMap<String, String>,
    used: u64,
    batch: Vec<KvWrite>,
    quota: Option<u64>,
) -> StorageResult<(u64, UndoLog)> {
    let projected = projected_size(entries, used, &batch);
    if let Some(quota) = quota {
        if projected > quota {
            return Err(StorageError::QuotaExceeded(format!(
                "key-value area would hold {projected} bytes, quota is {quota}"
            )));
        }
    }
    let mut undo = Vec::with_capacity(batch.len());
    for write in batch {
        let previous = match write {
            KvWrite::Put(k, v) => {
                let previous = entries.insert(k.clone(), v);
                (k, previous)
            }
            KvWrite::Remove(k) => {
                let previous = entries.remove(&k);
                (k, previous)
            }
        };
        undo.push(previous);
    }
    Ok((projected, undo))
}

fn rollback(entries: &mut BTreeMap<String, String>, undo: UndoLog) {
    for (key, previous) in undo.into_iter().rev() {
        match previous {
            Some(value) => {
                entries.insert(key, value);
            }
            None => {
                entries.remove(&key);
            }
        }
    }
}

fn scan(entries: &BTreeMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Volatile area, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryArea {
    entries: BTreeMap<String, String>,
    used: u64,
    quota: Option<u64>,
}

impl MemoryArea {
    pub fn new(quota: Option<u64>) -> Self {
        Self {
            quota,
            ..Self::default()
        }
    }
}

impl KeyValueArea for MemoryArea {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        Ok(scan(&self.entries, prefix))
    }

    fn write_batch(&mut self, batch: Vec<KvWrite>) -> StorageResult<()> {
        let (used, _) = apply_batch(&mut self.entries, self.used, batch, self.quota)?;
        self.used = used;
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.used
    }
}

/// Area persisted as one JSON object, rewritten through a temp file on every
/// batch.
#[derive(Debug)]
pub struct FileArea {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    used: u64,
    quota: Option<u64>,
}

impl FileArea {
    pub fn open(path: &Path, quota: Option<u64>) -> StorageResult<Self> {
        let entries: BTreeMap<String, String> = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            BTreeMap::new()
        };
        let used = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            used,
            quota,
        })
    }

    fn persist(&self) -> StorageResult<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&self.entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueArea for FileArea {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        Ok(scan(&self.entries, prefix))
    }

    fn write_batch(&mut self, batch: Vec<KvWrite>) -> StorageResult<()> {
        let (used, undo) = apply_batch(&mut self.entries, self.used, batch, self.quota)?;
        if let Err(e) = self.persist() {
            rollback(&mut self.entries, undo);
            return Err(e);
        }
        self.used = used;
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.used
    }
}

#[derive(Clone)]
pub struct KeyValueBackend {
    inner: Arc<Inner>,
}

struct Inner {
    area: Mutex<Box<dyn KeyValueArea>>,
    namespace: String,
    codec: RecordCodec,
    schema: SchemaState,
}

impl KeyValueBackend {
    pub fn new(
        area: Box<dyn KeyValueArea>,
        namespace: impl Into<String>,
        encryptor: Arc<dyn DataEncryptor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                area: Mutex::new(area),
                namespace: namespace.into(),
                codec: RecordCodec::new(encryptor),
                schema: SchemaState::default(),
            }),
        }
    }

    pub fn from_config(config: &StorageConfig, encryptor: Arc<dyn DataEncryptor>) -> StorageResult<Self> {
        let area: Box<dyn KeyValueArea> = match &config.path {
            Some(path) => Box::new(FileArea::open(path, config.kv_quota_bytes)?),
            None => Box::new(MemoryArea::new(config.kv_quota_bytes)),
        };
        Ok(Self::new(area, config.kv_namespace.clone(), encryptor))
    }

    /// Bytes the underlying area currently holds.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock_area().used_bytes()
    }
}

type Area = dyn KeyValueArea;

impl Inner {
    fn lock_area(&self) -> MutexGuard<'_, Box<dyn KeyValueArea>> {
        self.area.lock().unwrap_or_else(|poisoned| {
            warn!("key-value store: recovering from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn meta_key(&self, schema: &str) -> String {
        format!("{}{SEP}__schema__{SEP}{}", self.namespace, hex::encode(schema))
    }

    fn store_prefix(&self, store: &str) -> String {
        format!("{}{SEP}r{SEP}{}{SEP}", self.namespace, hex::encode(store))
    }

    fn record_key(&self, store: &str, pk: &str) -> String {
        format!("{}{pk}", self.store_prefix(store))
    }

    fn unique_prefix(&self, store: &str) -> String {
        format!("{}{SEP}u{SEP}{}{SEP}", self.namespace, hex::encode(store))
    }

    fn unique_key(&self, store: &str, index: &str, index_key: &str) -> String {
        format!("{}{}{SEP}{index_key}", self.unique_prefix(store), hex::encode(index))
    }

    /// Unique-index entry keys a record occupies.
    fn unique_keys(&self, store: &StoreSchema, record: &Value) -> Vec<String> {
        store
            .indexes
            .iter()
            .filter(|i| i.unique)
            .flat_map(|index| {
                key_codec::index_keys(record, index)
                    .into_iter()
                    .map(|key| self.unique_key(&store.name, &index.name, &key))
            })
            .collect()
    }

    /// Removals for the unique entries still owned by the record stored at `pk`.
    fn release_unique(&self, area: &Area, store: &StoreSchema, pk: &str) -> StorageResult<Vec<KvWrite>> {
        let Some(payload) = area.get(&self.record_key(&store.name, pk))? else {
            return Ok(Vec::new());
        };
        let Ok(record) = self.codec.decode(&payload) else {
            return Ok(Vec::new());
        };
        let mut batch = Vec::new();
        for key in self.unique_keys(store, &record) {
            if area.get(&key)?.as_deref() == Some(pk) {
                batch.push(KvWrite::Remove(key));
            }
        }
        Ok(batch)
    }

    /// Entries for a unique index added to a store that already holds records.
    fn backfill_unique(&self, area: &Area, store: &str, index: &StoreIndex) -> StorageResult<Vec<KvWrite>> {
        let prefix = self.store_prefix(store);
        let mut owners: HashMap<String, String> = HashMap::new();
        for (key, payload) in area.scan_prefix(&prefix)? {
            let pk = key[prefix.len()..].to_string();
            let Ok(record) = self.codec.decode(&payload) else {
                continue;
            };
            for index_key in key_codec::index_keys(&record, index) {
                let entry = self.unique_key(store, &index.name, &index_key);
                if owners.contains_key(&entry) {
                    warn!(store, index = %index.name, "existing records share a unique index key");
                    continue;
                }
                owners.insert(entry, pk.clone());
            }
        }
        Ok(owners.into_iter().map(|(key, pk)| KvWrite::Put(key, pk)).collect())
    }

    fn initialize(&self, requested: &StorageSchema) -> StorageResult<()> {
        let mut area = self.lock_area();
        let meta_key = self.meta_key(&requested.name);
        let persisted = area
            .get(&meta_key)?
            .map(|json| serde_json::from_str::<StorageSchema>(&json))
            .transpose()?;

        let schema = match plan_migration(persisted, requested)? {
            Migration::Unchanged(schema) => schema,
            Migration::Fresh(schema) => {
                area.write_batch(vec![KvWrite::Put(meta_key, serde_json::to_string(&schema)?)])?;
                info!(schema = %schema.name, version = schema.version, "key-value store initialized");
                schema
            }
            Migration::Upgrade { from, schema, diff } => {
                let mut batch = Vec::new();
                for (store, index) in diff.new_indexes.iter().filter(|(_, i)| i.unique) {
                    batch.extend(self.backfill_unique(area.as_ref(), store, index)?);
                }
                batch.push(KvWrite::Put(meta_key, serde_json::to_string(&schema)?));
                area.write_batch(batch)?;
                info!(
                    schema = %schema.name,
                    from,
                    to = schema.version,
                    new_stores = diff.new_stores.len(),
                    new_indexes = diff.new_indexes.len(),
                    "key-value store migrated"
                );
                schema
            }
        };
        self.schema.set(schema);
        Ok(())
    }

    /// Decryptable records of a store as (encoded pk, record), in key order.
    fn records(&self, area: &Area, store: &StoreSchema) -> StorageResult<Vec<(String, Value)>> {
        let prefix = self.store_prefix(&store.name);
        Ok(area
            .scan_prefix(&prefix)?
            .into_iter()
            .filter_map(|(key, payload)| {
                let pk = key[prefix.len()..].to_string();
                match self.codec.decode(&payload) {
                    Ok(record) => Some((pk, record)),
                    Err(e) => {
                        warn!(store = %store.name, pk = %pk, error = %e, "skipping undecryptable record");
                        None
                    }
                }
            })
            .collect())
    }

    fn check_unique(&self, area: &Area, store: &StoreSchema, record: &Value, pk: &str) -> StorageResult<()> {
        for index in store.indexes.iter().filter(|i| i.unique) {
            for key in key_codec::index_keys(record, index) {
                let Some(owner) = area.get(&self.unique_key(&store.name, &index.name, &key))? else {
                    continue;
                };
                // Entries left behind by an owner that is gone do not count.
                if owner != pk && area.get(&self.record_key(&store.name, &owner))?.is_some() {
                    return Err(StorageError::unique_violation(&store.name, &index.name));
                }
            }
        }
        Ok(())
    }

    fn create(&self, area: &mut Area, store: &str, value: Value) -> StorageResult<Value> {
        let store = self.schema.store(store)?;
        let prepared = prepare_create(&store, value)?;
        let key = self.record_key(&store.name, &prepared.encoded_key);
        if area.get(&key)?.is_some() {
            return Err(StorageError::record_exists(&store.name, &prepared.key));
        }
        self.check_unique(area, &store, &prepared.record, &prepared.encoded_key)?;
        let payload = self.codec.encode(&store, &prepared.key, &prepared.record)?;
        let mut batch = vec![KvWrite::Put(key, payload)];
        batch.extend(
            self.unique_keys(&store, &prepared.record)
                .into_iter()
                .map(|entry| KvWrite::Put(entry, prepared.encoded_key.clone())),
        );
        area.write_batch(batch)?;
        Ok(prepared.record)
    }

    fn read(&self, area: &Area, store: &str, key: &Value) -> StorageResult<Option<Value>> {
        let store = self.schema.store(store)?;
        let pk = key_codec::encode_primary_key(key)?;
        area.get(&self.record_key(&store.name, &pk))?
            .map(|payload| self.codec.decode(&payload))
            .transpose()
    }

    fn update(&self, area: &mut Area, store: &str, key: &Value, value: Value) -> StorageResult<Value> {
        let store = self.schema.store(store)?;
        let prepared = prepare_update(&store, key, value)?;
        let record_key = self.record_key(&store.name, &prepared.encoded_key);
        if area.get(&record_key)?.is_none() {
            return Err(StorageError::record_not_found(&store.name, key));
        }
        self.check_unique(area, &store, &prepared.record, &prepared.encoded_key)?;
        let payload = self.codec.encode(&store, &prepared.key, &prepared.record)?;
        let mut batch = self.release_unique(area, &store, &prepared.encoded_key)?;
        batch.push(KvWrite::Put(record_key, payload));
        batch.extend(
            self.unique_keys(&store, &prepared.record)
                .into_iter()
                .map(|entry| KvWrite::Put(entry, prepared.encoded_key.clone())),
        );
        area.write_batch(batch)?;
        Ok(prepared.record)
    }

    fn delete(&self, area: &mut Area, store: &str, key: &Value) -> StorageResult<()> {
        let store = self.schema.store(store)?;
        let pk = key_codec::encode_primary_key(key)?;
        let mut batch = self.release_unique(area, &store, &pk)?;
        batch.push(KvWrite::Remove(self.record_key(&store.name, &pk)));
        area.write_batch(batch)
    }

    fn query(&self, area: &Area, query: &StorageQuery) -> StorageResult<Vec<Value>> {
        let store = self.schema.store(&query.store)?;
        let range = query.encoded_range()?;
        let index = query
            .index
            .as_deref()
            .map(|name| store.require_index(name))
            .transpose()?;
        Ok(select_in_memory(self.records(area, &store)?, index, &range, query))
    }

    fn apply(&self, area: &mut Area, op: StorageOperation) -> StorageResult<OperationResult> {
        Ok(match op {
            StorageOperation::Create { store, value } => {
                OperationResult::Created(self.create(area, &store, value)?)
            }
            StorageOperation::Read { store, key } => {
                OperationResult::Read(self.read(area, &store, &key)?)
            }
            StorageOperation::Update { store, key, value } => {
                OperationResult::Updated(self.update(area, &store, &key, value)?)
            }
            StorageOperation::Delete { store, key } => {
                self.delete(area, &store, &key)?;
                OperationResult::Deleted
            }
            StorageOperation::Query(query) => OperationResult::Queried(self.query(area, &query)?),
        })
    }

    /// Removals of every record and unique entry in a store.
    fn clear_batch(&self, area: &Area, store: &str) -> StorageResult<Vec<KvWrite>> {
        let mut entries = area.scan_prefix(&self.store_prefix(store))?;
        entries.extend(area.scan_prefix(&self.unique_prefix(store))?);
        Ok(entries.into_iter().map(|(key, _)| KvWrite::Remove(key)).collect())
    }

    fn replace_store(&self, area: &mut Area, store: &str, records: Vec<Value>) -> StorageResult<()> {
        let store = self.schema.store(store)?;
        let mut batch = self.clear_batch(area, &store.name)?;
        let mut seen = HashSet::new();
        let mut unique_owners: HashMap<String, String> = HashMap::new();
        for record in records {
            let (key, pk) = restored_key(&store, &record)?;
            if !seen.insert(pk.clone()) {
                return Err(StorageError::record_exists(&store.name, &key));
            }
            for index in store.indexes.iter().filter(|i| i.unique) {
                for index_key in key_codec::index_keys(&record, index) {
                    let entry = self.unique_key(&store.name, &index.name, &index_key);
                    if unique_owners.insert(entry, pk.clone()).is_some() {
                        return Err(StorageError::unique_violation(&store.name, &index.name));
                    }
                }
            }
            let payload = self.codec.encode(&store, &key, &record)?;
            batch.push(KvWrite::Put(self.record_key(&store.name, &pk), payload));
        }
        batch.extend(unique_owners.into_iter().map(|(entry, pk)| KvWrite::Put(entry, pk)));
        area.write_batch(batch)
    }

    fn store_metrics(&self, area: &Area, store: &str, sample_size: usize) -> StorageResult<StoreMetrics> {
        let store = self.schema.store(store)?;
        let entries = area.scan_prefix(&self.store_prefix(&store.name))?;
        let sizes: Vec<u64> = entries
            .iter()
            .take(sample_size)
            .map(|(_, payload)| payload.len() as u64)
            .collect();
        Ok(StoreMetrics::from_sample(entries.len() as u64, &sizes))
    }
}

#[async_trait]
impl StorageBackend for KeyValueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::KeyValue
    }

    fn transaction_support(&self) -> TransactionSupport {
        TransactionSupport::BestEffort
    }

    async fn initialize(&self, schema: &StorageSchema) -> StorageResult<()> {
        let schema = schema.clone();
        run_blocking(&self.inner, move |inner| inner.initialize(&schema)).await
    }

    fn schema(&self) -> StorageResult<Arc<StorageSchema>> {
        self.inner.schema.get()
    }

    async fn create(&self, store: &str, value: Value) -> StorageResult<Value> {
        let store = store.to_string();
        run_blocking(&self.inner, move |inner| {
            inner.create(inner.lock_area().as_mut(), &store, value)
        })
        .await
    }

    async fn read(&self, store: &str, key: &Value) -> StorageResult<Option<Value>> {
        let (store, key) = (store.to_string(), key.clone());
        run_blocking(&self.inner, move |inner| {
            inner.read(inner.lock_area().as_ref(), &store, &key)
        })
        .await
    }

    async fn update(&self, store: &str, key: &Value, value: Value) -> StorageResult<Value> {
        let (store, key) = (store.to_string(), key.clone());
        run_blocking(&self.inner, move |inner| {
            inner.update(inner.lock_area().as_mut(), &store, &key, value)
        })
        .await
    }

    async fn delete(&self, store: &str, key: &Value) -> StorageResult<()> {
        let (store, key) = (store.to_string(), key.clone());
        run_blocking(&self.inner, move |inner| {
            inner.delete(inner.lock_area().as_mut(), &store, &key)
        })
        .await
    }

    async fn query(&self, query: &StorageQuery) -> StorageResult<Vec<Value>> {
        let query = query.clone();
        run_blocking(&self.inner, move |inner| {
            inner.query(inner.lock_area().as_ref(), &query)
        })
        .await
    }

    async fn transaction(
        &self,
        operations: Vec<StorageOperation>,
    ) -> StorageResult<Vec<OperationResult>> {
        run_blocking(&self.inner, move |inner| {
            let mut area = inner.lock_area();
            operations
                .into_iter()
                .map(|op| inner.apply(area.as_mut(), op))
                .collect()
        })
        .await
    }

    async fn dump_store(&self, store: &str) -> StorageResult<Vec<Value>> {
        let store = store.to_string();
        run_blocking(&self.inner, move |inner| {
            let schema = inner.schema.store(&store)?;
            let records = inner.records(inner.lock_area().as_ref(), &schema)?;
            Ok(records.into_iter().map(|(_, record)| record).collect())
        })
        .await
    }

    async fn replace_store(&self, store: &str, records: Vec<Value>) -> StorageResult<()> {
        let store = store.to_string();
        run_blocking(&self.inner, move |inner| {
            inner.replace_store(inner.lock_area().as_mut(), &store, records)
        })
        .await
    }

    async fn store_metrics(&self, store: &str, sample_size: usize) -> StorageResult<StoreMetrics> {
        let store = store.to_string();
        run_blocking(&self.inner, move |inner| {
            inner.store_metrics(inner.lock_area().as_ref(), &store, sample_size)
        })
        .await
    }

    async fn clear_store(&self, store: &str) -> StorageResult<()> {
        let store = store.to_string();
        run_blocking(&self.inner, move |inner| {
            let schema = inner.schema.store(&store)?;
            let mut area = inner.lock_area();
            let batch = inner.clear_batch(area.as_ref(), &schema.name)?;
            area.write_batch(batch)
        })
        .await
    }
}
