//! Object-store backend on DuckDB.
//!
//! All stores share one record table keyed by (store, encoded primary key) and
//! one index-entry table keyed by (store, index, encoded index key, primary
//! key). Payloads hold the (possibly sealed) record; index keys stay plaintext
//! so range scans never need to decrypt.

use super::{
    now_millis, plan_migration, prepare_create, prepare_update, restored_key, run_blocking,
    Migration, SchemaState, StorageBackend, TransactionSupport,
};
use crate::codec::RecordCodec;
use crate::config::{BackendKind, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::key_codec;
use crate::metrics::StoreMetrics;
use crate::operation::{OperationResult, StorageOperation};
use crate::query::{Collector, Direction, StorageQuery};
use crate::schema::{StorageSchema, StoreIndex, StoreSchema};
use async_trait::async_trait;
use duckdb::{params, Connection};
use haven_crypto::DataEncryptor;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Opens a DuckDB database, removing a stale WAL file and retrying once if the
/// first open fails.
pub fn open_duckdb_with_wal_recovery(
    path: &Path,
    memory_limit: &str,
    threads: u32,
) -> StorageResult<Connection> {
    let conn = match Connection::open(path) {
        Ok(c) => c,
        Err(first_err) => {
            let wal_path = path.with_extension(
                path.extension()
                    .map(|ext| format!("{}.wal", ext.to_string_lossy()))
                    .unwrap_or_else(|| "wal".to_string()),
            );
            if wal_path.exists() {
                warn!(wal = %wal_path.display(), "duckdb open failed, removing stale WAL and retrying");
                if std::fs::remove_file(&wal_path).is_ok() {
                    let c = Connection::open(path)?;
                    apply_resource_limits(&c, memory_limit, threads)?;
                    return Ok(c);
                }
            }
            return Err(first_err.into());
        }
    };
    apply_resource_limits(&conn, memory_limit, threads)?;
    Ok(conn)
}

fn apply_resource_limits(conn: &Connection, memory_limit: &str, threads: u32) -> StorageResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA memory_limit='{}'; PRAGMA threads={};",
        memory_limit.replace('\'', ""),
        threads
    ))?;
    Ok(())
}

#[derive(Clone)]
pub struct ObjectStoreBackend {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    codec: RecordCodec,
    schema: SchemaState,
}

impl ObjectStoreBackend {
    pub fn open(
        path: &Path,
        memory_limit: &str,
        threads: u32,
        encryptor: Arc<dyn DataEncryptor>,
    ) -> StorageResult<Self> {
        let conn = open_duckdb_with_wal_recovery(path, memory_limit, threads)?;
        Self::with_connection(conn, encryptor)
    }

    pub fn open_in_memory(encryptor: Arc<dyn DataEncryptor>) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, encryptor)
    }

    pub fn from_config(config: &StorageConfig, encryptor: Arc<dyn DataEncryptor>) -> StorageResult<Self> {
        match &config.path {
            Some(path) => Self::open(path, &config.memory_limit, config.threads, encryptor),
            None => Self::open_in_memory(encryptor),
        }
    }

    fn with_connection(conn: Connection, encryptor: Arc<dyn DataEncryptor>) -> StorageResult<Self> {
        create_base_tables(&conn)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                codec: RecordCodec::new(encryptor),
                schema: SchemaState::default(),
            }),
        })
    }
}

fn create_base_tables(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS object_records (
            store VARCHAR NOT NULL,
            pk VARCHAR NOT NULL,
            payload VARCHAR NOT NULL,
            created_at BIGINT NOT NULL,
            modified_at BIGINT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_object_records_pk ON object_records(store, pk);

        CREATE TABLE IF NOT EXISTS object_index_entries (
            store VARCHAR NOT NULL,
            index_name VARCHAR NOT NULL,
            index_key VARCHAR NOT NULL,
            pk VARCHAR NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_object_index_lookup
            ON object_index_entries(store, index_name, index_key);

        CREATE TABLE IF NOT EXISTS object_schema_meta (
            name VARCHAR PRIMARY KEY,
            version INTEGER NOT NULL,
            schema_json VARCHAR NOT NULL,
            updated_at BIGINT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// Runs `f` inside BEGIN/COMMIT, rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> StorageResult<T>,
) -> StorageResult<T> {
    conn.execute_batch("BEGIN TRANSACTION")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

impl Inner {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("object store: recovering from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn initialize(&self, requested: &StorageSchema) -> StorageResult<()> {
        let conn = self.lock_conn();
        let persisted = match conn.query_row(
            "SELECT schema_json FROM object_schema_meta WHERE name = ?",
            params![requested.name],
            |row| row.get::<_, String>(0),
        ) {
            Ok(json) => Some(serde_json::from_str::<StorageSchema>(&json)?),
            Err(duckdb::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        let schema = match plan_migration(persisted, requested)? {
            Migration::Unchanged(schema) => schema,
            Migration::Fresh(schema) => {
                write_schema_meta(&conn, &schema)?;
                info!(schema = %schema.name, version = schema.version, "object store initialized");
                schema
            }
            Migration::Upgrade { from, schema, diff } => {
                in_transaction(&conn, |conn| {
                    for (store, index) in &diff.new_indexes {
                        self.backfill_index(conn, store, index)?;
                    }
                    write_schema_meta(conn, &schema)
                })?;
                info!(
                    schema = %schema.name,
                    from,
                    to = schema.version,
                    new_stores = diff.new_stores.len(),
                    new_indexes = diff.new_indexes.len(),
                    "object store migrated"
                );
                schema
            }
        };
        self.schema.set(schema);
        Ok(())
    }

    fn backfill_index(&self, conn: &Connection, store: &str, index: &StoreIndex) -> StorageResult<()> {
        let mut stmt = conn.prepare("SELECT pk, payload FROM object_records WHERE store = ?")?;
        let rows: Vec<(String, String)> = stmt
            .query_map(params![store], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        let mut filled = 0usize;
        for (pk, payload) in rows {
            let record = match self.codec.decode(&payload) {
                Ok(record) => record,
                Err(e) => {
                    warn!(store, pk = %pk, error = %e, "skipping undecryptable record during index back-fill");
                    continue;
                }
            };
            for key in key_codec::index_keys(&record, index) {
                if index.unique && index_key_taken(conn, store, &index.name, &key, &pk)? {
                    return Err(StorageError::unique_violation(store, &index.name));
                }
                conn.execute(
                    "INSERT INTO object_index_entries (store, index_name, index_key, pk) VALUES (?, ?, ?, ?)",
                    params![store, index.name, key, pk],
                )?;
                filled += 1;
            }
        }
        info!(store, index = %index.name, entries = filled, "index back-filled");
        Ok(())
    }

    fn create(&self, conn: &Connection, store: &str, value: Value) -> StorageResult<Value> {
        let store = self.schema.store(store)?;
        let prepared = prepare_create(&store, value)?;
        let payload = self.codec.encode(&store, &prepared.key, &prepared.record)?;
        in_transaction(conn, |conn| {
            if record_exists(conn, &store.name, &prepared.encoded_key)? {
                return Err(StorageError::record_exists(&store.name, &prepared.key));
            }
            check_unique(conn, &store, &prepared.record, &prepared.encoded_key)?;
            let now = now_millis();
            conn.execute(
                "INSERT INTO object_records (store, pk, payload, created_at, modified_at) VALUES (?, ?, ?, ?, ?)",
                params![store.name, prepared.encoded_key, payload, now, now],
            )?;
            insert_index_entries(conn, &store, &prepared.record, &prepared.encoded_key)
        })?;
        Ok(prepared.record)
    }

    fn read(&self, conn: &Connection, store: &str, key: &Value) -> StorageResult<Option<Value>> {
        let store = self.schema.store(store)?;
        let pk = key_codec::encode_primary_key(key)?;
        let result = conn.query_row(
            "SELECT payload FROM object_records WHERE store = ? AND pk = ?",
            params![store.name, pk],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(payload) => self.codec.decode(&payload).map(Some),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, conn: &Connection, store: &str, key: &Value, value: Value) -> StorageResult<Value> {
        let store = self.schema.store(store)?;
        let prepared = prepare_update(&store, key, value)?;
        let payload = self.codec.encode(&store, &prepared.key, &prepared.record)?;
        in_transaction(conn, |conn| {
            if !record_exists(conn, &store.name, &prepared.encoded_key)? {
                return Err(StorageError::record_not_found(&store.name, key));
            }
            check_unique(conn, &store, &prepared.record, &prepared.encoded_key)?;
            conn.execute(
                "UPDATE object_records SET payload = ?, modified_at = ? WHERE store = ? AND pk = ?",
                params![payload, now_millis(), store.name, prepared.encoded_key],
            )?;
            conn.execute(
                "DELETE FROM object_index_entries WHERE store = ? AND pk = ?",
                params![store.name, prepared.encoded_key],
            )?;
            insert_index_entries(conn, &store, &prepared.record, &prepared.encoded_key)
        })?;
        Ok(prepared.record)
    }

    fn delete(&self, conn: &Connection, store: &str, key: &Value) -> StorageResult<()> {
        let store = self.schema.store(store)?;
        let pk = key_codec::encode_primary_key(key)?;
        in_transaction(conn, |conn| {
            conn.execute(
                "DELETE FROM object_index_entries WHERE store = ? AND pk = ?",
                params![store.name, pk],
            )?;
            conn.execute(
                "DELETE FROM object_records WHERE store = ? AND pk = ?",
                params![store.name, pk],
            )?;
            Ok(())
        })
    }

    fn query(&self, conn: &Connection, query: &StorageQuery) -> StorageResult<Vec<Value>> {
        let store = self.schema.store(&query.store)?;
        let range = query.encoded_range()?;
        let order = match query.direction {
            Direction::Next => "ASC",
            Direction::Prev => "DESC",
        };

        let mut params: Vec<String> = vec![store.name.clone()];
        let (mut sql, key_column) = match &query.index {
            Some(index) => {
                store.require_index(index)?;
                params.push(index.clone());
                (
                    "SELECT r.payload FROM object_index_entries e \
                     JOIN object_records r ON r.store = e.store AND r.pk = e.pk \
                     WHERE e.store = ? AND e.index_name = ?"
                        .to_string(),
                    "e.index_key",
                )
            }
            None => (
                "SELECT r.payload FROM object_records r WHERE r.store = ?".to_string(),
                "r.pk",
            ),
        };
        if let Some(lower) = range.lower {
            let op = if range.lower_open { ">" } else { ">=" };
            sql.push_str(&format!(" AND {key_column} {op} ?"));
            params.push(lower);
        }
        if let Some(upper) = range.upper {
            let op = if range.upper_open { "<" } else { "<=" };
            sql.push_str(&format!(" AND {key_column} {op} ?"));
            params.push(upper);
        }
        sql.push_str(&format!(" ORDER BY {key_column} {order}, r.pk {order}"));

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(duckdb::params_from_iter(params.iter()))?;
        let mut collector = Collector::new(query);
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            match self.codec.decode(&payload) {
                Ok(record) => {
                    if !collector.push(record) {
                        break;
                    }
                }
                Err(e) => warn!(store = %store.name, error = %e, "skipping undecryptable record"),
            }
        }
        Ok(collector.finish())
    }

    fn apply(&self, conn: &Connection, op: StorageOperation) -> StorageResult<OperationResult> {
        Ok(match op {
            StorageOperation::Create { store, value } => {
                OperationResult::Created(self.create(conn, &store, value)?)
            }
            StorageOperation::Read { store, key } => {
                OperationResult::Read(self.read(conn, &store, &key)?)
            }
            StorageOperation::Update { store, key, value } => {
                OperationResult::Updated(self.update(conn, &store, &key, value)?)
            }
            StorageOperation::Delete { store, key } => {
                self.delete(conn, &store, &key)?;
                OperationResult::Deleted
            }
            StorageOperation::Query(query) => OperationResult::Queried(self.query(conn, &query)?),
        })
    }

    fn replace_store(&self, conn: &Connection, store: &str, records: Vec<Value>) -> StorageResult<()> {
        let store = self.schema.store(store)?;
        let now = now_millis();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let (key, pk) = restored_key(&store, &record)?;
            let payload = self.codec.encode(&store, &key, &record)?;
            rows.push((key, pk, payload, record));
        }
        in_transaction(conn, |conn| {
            clear(conn, &store.name)?;
            for (key, pk, payload, record) in &rows {
                if record_exists(conn, &store.name, pk)? {
                    return Err(StorageError::record_exists(&store.name, key));
                }
                check_unique(conn, &store, record, pk)?;
                conn.execute(
                    "INSERT INTO object_records (store, pk, payload, created_at, modified_at) VALUES (?, ?, ?, ?, ?)",
                    params![store.name, pk, payload, now, now],
                )?;
                insert_index_entries(conn, &store, record, pk)?;
            }
            Ok(())
        })
    }

    fn store_metrics(&self, conn: &Connection, store: &str, sample_size: usize) -> StorageResult<StoreMetrics> {
        let store = self.schema.store(store)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM object_records WHERE store = ?",
            params![store.name],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare("SELECT strlen(payload) FROM object_records WHERE store = ? LIMIT ?")?;
        let sizes: Vec<u64> = stmt
            .query_map(params![store.name, sample_size as i64], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|s| s.max(0) as u64)
            .collect();
        Ok(StoreMetrics::from_sample(count.max(0) as u64, &sizes))
    }
}

fn write_schema_meta(conn: &Connection, schema: &StorageSchema) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO object_schema_meta (name, version, schema_json, updated_at) VALUES (?, ?, ?, ?)",
        params![schema.name, schema.version, serde_json::to_string(schema)?, now_millis()],
    )?;
    Ok(())
}

fn record_exists(conn: &Connection, store: &str, pk: &str) -> StorageResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM object_records WHERE store = ? AND pk = ?",
        params![store, pk],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn index_key_taken(conn: &Connection, store: &str, index: &str, key: &str, pk: &str) -> StorageResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM object_index_entries WHERE store = ? AND index_name = ? AND index_key = ? AND pk <> ?",
        params![store, index, key, pk],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn check_unique(conn: &Connection, store: &StoreSchema, record: &Value, pk: &str) -> StorageResult<()> {
    for index in store.indexes.iter().filter(|i| i.unique) {
        for key in key_codec::index_keys(record, index) {
            if index_key_taken(conn, &store.name, &index.name, &key, pk)? {
                return Err(StorageError::unique_violation(&store.name, &index.name));
            }
        }
    }
    Ok(())
}

fn insert_index_entries(conn: &Connection, store: &StoreSchema, record: &Value, pk: &str) -> StorageResult<()> {
    for index in &store.indexes {
        for key in key_codec::index_keys(record, index) {
            conn.execute(
                "INSERT INTO object_index_entries (store, index_name, index_key, pk) VALUES (?, ?, ?, ?)",
                params![store.name, index.name, key, pk],
            )?;
        }
    }
    Ok(())
}

fn clear(conn: &Connection, store: &str) -> StorageResult<()> {
    conn.execute("DELETE FROM object_index_entries WHERE store = ?", params![store])?;
    conn.execute("DELETE FROM object_records WHERE store = ?", params![store])?;
    Ok(())
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
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
        run_blocking(&self.inner, move |inner| inner.create(&inner.lock_conn(), &store, value)).await
    }

    async fn read(&self, store: &str, key: &Value) -> StorageResult<Option<Value>> {
        let (store, key) = (store.to_string(), key.clone());
        run_blocking(&self.inner, move |inner| inner.read(&inner.lock_conn(), &store, &key)).await
    }

    async fn update(&self, store: &str, key: &Value, value: Value) -> StorageResult<Value> {
        let (store, key) = (store.to_string(), key.clone());
        run_blocking(&self.inner, move |inner| {
            inner.update(&inner.lock_conn(), &store, &key, value)
        })
        .await
    }

    async fn delete(&self, store: &str, key: &Value) -> StorageResult<()> {
        let (store, key) = (store.to_string(), key.clone());
        run_blocking(&self.inner, move |inner| inner.delete(&inner.lock_conn(), &store, &key)).await
    }

    async fn query(&self, query: &StorageQuery) -> StorageResult<Vec<Value>> {
        let query = query.clone();
        run_blocking(&self.inner, move |inner| inner.query(&inner.lock_conn(), &query)).await
    }

    async fn transaction(
        &self,
        operations: Vec<StorageOperation>,
    ) -> StorageResult<Vec<OperationResult>> {
        run_blocking(&self.inner, move |inner| {
            let conn = inner.lock_conn();
            operations
                .into_iter()
                .map(|op| inner.apply(&conn, op))
                .collect()
        })
        .await
    }

    async fn dump_store(&self, store: &str) -> StorageResult<Vec<Value>> {
        self.query(&StorageQuery::new(store)).await
    }

    async fn replace_store(&self, store: &str, records: Vec<Value>) -> StorageResult<()> {
        let store = store.to_string();
        run_blocking(&self.inner, move |inner| {
            inner.replace_store(&inner.lock_conn(), &store, records)
        })
        .await
    }

    async fn store_metrics(&self, store: &str, sample_size: usize) -> StorageResult<StoreMetrics> {
        let store = store.to_string();
        run_blocking(&self.inner, move |inner| {
            inner.store_metrics(&inner.lock_conn(), &store, sample_size)
        })
        .await
    }

    async fn clear_store(&self, store: &str) -> StorageResult<()> {
        let store = store.to_string();
        run_blocking(&self.inner, move |inner| {
            let store = inner.schema.store(&store)?;
            let conn = inner.lock_conn();
            in_transaction(&conn, |conn| clear(conn, &store.name))
        })
        .await
    }
}
