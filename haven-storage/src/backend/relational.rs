//! Relational backend on SQLite.
//!
//! One table per store: `pk`, `payload`, `created`, `updated`, plus one
//! plaintext encoded-key column per single-path index backed by a real SQL
//! index. Compound and multi-entry indexes have no column; queries on them
//! evaluate the range in memory after decryption.

use super::{
    now_millis, plan_migration, prepare_create, prepare_update, restored_key, run_blocking,
    select_in_memory, Migration, SchemaState, StorageBackend, TransactionSupport,
};
use crate::codec::RecordCodec;
use crate::config::{BackendKind, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::key_codec;
use crate::metrics::StoreMetrics;
use crate::operation::{OperationResult, StorageOperation};
use crate::query::{Collector, Direction, EncodedRange, StorageQuery};
use crate::schema::{StorageSchema, StoreIndex, StoreSchema};
use async_trait::async_trait;
use haven_crypto::DataEncryptor;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

#[derive(Clone)]
pub struct RelationalBackend {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    codec: RecordCodec,
    schema: SchemaState,
}

impl RelationalBackend {
    pub fn open(path: &Path, encryptor: Arc<dyn DataEncryptor>) -> StorageResult<Self> {
        Self::with_connection(Connection::open(path)?, encryptor)
    }

    pub fn open_in_memory(encryptor: Arc<dyn DataEncryptor>) -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, encryptor)
    }

    pub fn from_config(config: &StorageConfig, encryptor: Arc<dyn DataEncryptor>) -> StorageResult<Self> {
        match &config.path {
            Some(path) => Self::open(path, encryptor),
            None => Self::open_in_memory(encryptor),
        }
    }

    fn with_connection(conn: Connection, encryptor: Arc<dyn DataEncryptor>) -> StorageResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS haven_schema_meta (
                name TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                schema_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                codec: RecordCodec::new(encryptor),
                schema: SchemaState::default(),
            }),
        })
    }
}

/// Table names are hex-encoded so any store name is a safe identifier.
fn table_name(store: &str) -> String {
    format!("st_{}", hex::encode(store))
}

fn index_column(index: &str) -> String {
    format!("ix_{}", hex::encode(index))
}

fn create_store_table(conn: &Connection, store: &StoreSchema) -> StorageResult<()> {
    let table = table_name(&store.name);
    let columns: String = store
        .indexes
        .iter()
        .filter(|i| i.is_simple())
        .map(|i| format!(", \"{}\" TEXT", index_column(&i.name)))
        .collect();
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            pk TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL{columns}
        );"
    ))?;
    for index in store.indexes.iter().filter(|i| i.is_simple()) {
        create_sql_index(conn, &table, index)?;
    }
    Ok(())
}

fn create_sql_index(conn: &Connection, table: &str, index: &StoreIndex) -> StorageResult<()> {
    let column = index_column(&index.name);
    let unique = if index.unique { "UNIQUE " } else { "" };
    conn.execute_batch(&format!(
        "CREATE {unique}INDEX IF NOT EXISTS \"{table}__{column}\" ON \"{table}\"(\"{column}\");"
    ))?;
    Ok(())
}

/// The single encoded key a simple index stores for `record`, if any.
fn simple_index_key(record: &Value, index: &StoreIndex) -> Option<String> {
    key_codec::index_keys(record, index).into_iter().next()
}

fn write_schema_meta(conn: &Connection, schema: &StorageSchema) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO haven_schema_meta (name, version, schema_json, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![schema.name, schema.version, serde_json::to_string(schema)?, now_millis()],
    )?;
    Ok(())
}

/// Maps a constraint failure on insert/update to a precise message.
fn constraint_error(e: rusqlite::Error, store: &StoreSchema, key: &Value, is_create: bool) -> StorageError {
    let detail = e.to_string();
    let mapped = StorageError::from(e);
    if !matches!(mapped, StorageError::AlreadyExists(_)) {
        return mapped;
    }
    if let Some(index) = store
        .indexes
        .iter()
        .find(|i| detail.contains(&index_column(&i.name)))
    {
        return StorageError::unique_violation(&store.name, &index.name);
    }
    if is_create {
        StorageError::record_exists(&store.name, key)
    } else {
        mapped
    }
}

impl Inner {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("relational store: recovering from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn initialize(&self, requested: &StorageSchema) -> StorageResult<()> {
        let conn = self.lock_conn();
        let persisted: Option<String> = conn
            .query_row(
                "SELECT schema_json FROM haven_schema_meta WHERE name = ?1",
                params![requested.name],
                |row| row.get(0),
            )
            .optional()?;
        let persisted = persisted
            .map(|json| serde_json::from_str::<StorageSchema>(&json))
            .transpose()?;

        let schema = match plan_migration(persisted, requested)? {
            Migration::Unchanged(schema) => schema,
            Migration::Fresh(schema) => {
                let tx = conn.unchecked_transaction()?;
                for store in &schema.stores {
                    create_store_table(&tx, store)?;
                }
                write_schema_meta(&tx, &schema)?;
                tx.commit()?;
                info!(schema = %schema.name, version = schema.version, "relational store initialized");
                schema
            }
            Migration::Upgrade { from, schema, diff } => {
                let tx = conn.unchecked_transaction()?;
                for store in &diff.new_stores {
                    create_store_table(&tx, store)?;
                }
                for (store, index) in &diff.new_indexes {
                    self.add_index(&tx, store, index)?;
                }
                write_schema_meta(&tx, &schema)?;
                tx.commit()?;
                info!(
                    schema = %schema.name,
                    from,
                    to = schema.version,
                    new_stores = diff.new_stores.len(),
                    new_indexes = diff.new_indexes.len(),
                    "relational store migrated"
                );
                schema
            }
        };
        self.schema.set(schema);
        Ok(())
    }

    /// Adds and back-fills the column for a new simple index.
    fn add_index(&self, conn: &Connection, store: &str, index: &StoreIndex) -> StorageResult<()> {
        if !index.is_simple() {
            return Ok(());
        }
        let table = table_name(store);
        let column = index_column(&index.name);
        conn.execute_batch(&format!("ALTER TABLE \"{table}\" ADD COLUMN \"{column}\" TEXT;"))?;

        let rows: Vec<(String, String)> = {
            let mut stmt = conn.prepare(&format!("SELECT pk, payload FROM \"{table}\""))?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?
        };
        for (pk, payload) in rows {
            match self.codec.decode(&payload) {
                Ok(record) => {
                    conn.execute(
                        &format!("UPDATE \"{table}\" SET \"{column}\" = ?1 WHERE pk = ?2"),
                        params![simple_index_key(&record, index), pk],
                    )?;
                }
                Err(e) => warn!(store, pk = %pk, error = %e, "skipping undecryptable record during index back-fill"),
            }
        }
        create_sql_index(conn, &table, index)?;
        info!(store, index = %index.name, "index back-filled");
        Ok(())
    }

    fn create(&self, conn: &Connection, store: &str, value: Value) -> StorageResult<Value> {
        let store = self.schema.store(store)?;
        let prepared = prepare_create(&store, value)?;
        let payload = self.codec.encode(&store, &prepared.key, &prepared.record)?;
        let simple: Vec<&StoreIndex> = store.indexes.iter().filter(|i| i.is_simple()).collect();

        let mut columns = String::from("pk, payload, created, updated");
        let mut placeholders = String::from("?1, ?2, ?3, ?4");
        let now = now_millis();
        let mut values = vec![
            SqlValue::Text(prepared.encoded_key.clone()),
            SqlValue::Text(payload),
            SqlValue::Integer(now),
            SqlValue::Integer(now),
        ];
        for index in &simple {
            columns.push_str(&format!(", \"{}\"", index_column(&index.name)));
            values.push(
                simple_index_key(&prepared.record, index).map_or(SqlValue::Null, SqlValue::Text),
            );
            placeholders.push_str(&format!(", ?{}", values.len()));
        }

        conn.execute(
            &format!(
                "INSERT INTO \"{}\" ({columns}) VALUES ({placeholders})",
                table_name(&store.name)
            ),
            params_from_iter(values.iter()),
        )
        .map_err(|e| constraint_error(e, &store, &prepared.key, true))?;
        Ok(prepared.record)
    }

    fn read(&self, conn: &Connection, store: &str, key: &Value) -> StorageResult<Option<Value>> {
        let store = self.schema.store(store)?;
        let pk = key_codec::encode_primary_key(key)?;
        let payload: Option<String> = conn
            .query_row(
                &format!("SELECT payload FROM \"{}\" WHERE pk = ?1", table_name(&store.name)),
                params![pk],
                |row| row.get(0),
            )
            .optional()?;
        payload.map(|p| self.codec.decode(&p)).transpose()
    }

    fn update(&self, conn: &Connection, store: &str, key: &Value, value: Value) -> StorageResult<Value> {
        let store = self.schema.store(store)?;
        let prepared = prepare_update(&store, key, value)?;
        let payload = self.codec.encode(&store, &prepared.key, &prepared.record)?;

        let mut assignments = String::from("payload = ?1, updated = ?2");
        let mut values = vec![SqlValue::Text(payload), SqlValue::Integer(now_millis())];
        for index in store.indexes.iter().filter(|i| i.is_simple()) {
            values.push(
                simple_index_key(&prepared.record, index).map_or(SqlValue::Null, SqlValue::Text),
            );
            assignments.push_str(&format!(", \"{}\" = ?{}", index_column(&index.name), values.len()));
        }
        values.push(SqlValue::Text(prepared.encoded_key.clone()));
        let sql = format!(
            "UPDATE \"{}\" SET {assignments} WHERE pk = ?{}",
            table_name(&store.name),
            values.len()
        );

        let changed = conn
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(|e| constraint_error(e, &store, key, false))?;
        if changed == 0 {
            return Err(StorageError::record_not_found(&store.name, key));
        }
        Ok(prepared.record)
    }

    fn delete(&self, conn: &Connection, store: &str, key: &Value) -> StorageResult<()> {
        let store = self.schema.store(store)?;
        let pk = key_codec::encode_primary_key(key)?;
        conn.execute(
            &format!("DELETE FROM \"{}\" WHERE pk = ?1", table_name(&store.name)),
            params![pk],
        )?;
        Ok(())
    }

    fn query(&self, conn: &Connection, query: &StorageQuery) -> StorageResult<Vec<Value>> {
        let store = self.schema.store(&query.store)?;
        let range = query.encoded_range()?;
        let index = query
            .index
            .as_deref()
            .map(|name| store.require_index(name))
            .transpose()?;

        match index {
            Some(index) if !index.is_simple() => {
                Ok(select_in_memory(self.scan(conn, &store)?, Some(index), &range, query))
            }
            _ => {
                let column = index.map_or_else(|| "pk".to_string(), |i| format!("\"{}\"", index_column(&i.name)));
                self.query_pushdown(conn, &store, &column, &range, query)
            }
        }
    }

    fn query_pushdown(
        &self,
        conn: &Connection,
        store: &StoreSchema,
        column: &str,
        range: &EncodedRange,
        query: &StorageQuery,
    ) -> StorageResult<Vec<Value>> {
        let mut sql = format!(
            "SELECT payload FROM \"{}\" WHERE {column} IS NOT NULL",
            table_name(&store.name)
        );
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(lower) = &range.lower {
            values.push(SqlValue::Text(lower.clone()));
            let op = if range.lower_open { ">" } else { ">=" };
            sql.push_str(&format!(" AND {column} {op} ?{}", values.len()));
        }
        if let Some(upper) = &range.upper {
            values.push(SqlValue::Text(upper.clone()));
            let op = if range.upper_open { "<" } else { "<=" };
            sql.push_str(&format!(" AND {column} {op} ?{}", values.len()));
        }
        let order = match query.direction {
            Direction::Next => "ASC",
            Direction::Prev => "DESC",
        };
        sql.push_str(&format!(" ORDER BY {column} {order}, pk {order}"));

        // Paging can only move into SQL when no in-memory filter runs first.
        let mut effective = query.clone();
        if query.filter.is_none() {
            values.push(SqlValue::Integer(query.limit.map_or(-1, |l| l as i64)));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
            values.push(SqlValue::Integer(query.offset as i64));
            sql.push_str(&format!(" OFFSET ?{}", values.len()));
            effective.offset = 0;
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut collector = Collector::new(&effective);
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

    /// All decryptable records of a store in primary-key order.
    fn scan(&self, conn: &Connection, store: &StoreSchema) -> StorageResult<Vec<(String, Value)>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT pk, payload FROM \"{}\" ORDER BY pk",
            table_name(&store.name)
        ))?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(pk, payload)| match self.codec.decode(&payload) {
                Ok(record) => Some((pk, record)),
                Err(e) => {
                    warn!(store = %store.name, pk = %pk, error = %e, "skipping undecryptable record");
                    None
                }
            })
            .collect())
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
        let tx = conn.unchecked_transaction()?;
        tx.execute(&format!("DELETE FROM \"{}\"", table_name(&store.name)), [])?;
        for record in records {
            let (key, _) = restored_key(&store, &record)?;
            self.create(&tx, &store.name, record)
                .map_err(|e| match e {
                    StorageError::AlreadyExists(_) => StorageError::record_exists(&store.name, &key),
                    other => other,
                })?;
        }
        tx.commit()?;
        Ok(())
    }

    fn store_metrics(&self, conn: &Connection, store: &str, sample_size: usize) -> StorageResult<StoreMetrics> {
        let store = self.schema.store(store)?;
        let table = table_name(&store.name);
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))?;
        let mut stmt = conn.prepare(&format!("SELECT length(payload) FROM \"{table}\" LIMIT ?1"))?;
        let sizes: Vec<u64> = stmt
            .query_map(params![sample_size as i64], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|s| s.max(0) as u64)
            .collect();
        Ok(StoreMetrics::from_sample(count.max(0) as u64, &sizes))
    }

    fn clear_store(&self, conn: &Connection, store: &str) -> StorageResult<()> {
        let store = self.schema.store(store)?;
        conn.execute(&format!("DELETE FROM \"{}\"", table_name(&store.name)), [])?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn transaction_support(&self) -> TransactionSupport {
        TransactionSupport::Atomic
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

    /// Runs every operation in one SQLite transaction; any failure rolls back.
    async fn transaction(
        &self,
        operations: Vec<StorageOperation>,
    ) -> StorageResult<Vec<OperationResult>> {
        run_blocking(&self.inner, move |inner| {
            let conn = inner.lock_conn();
            let tx = conn.unchecked_transaction()?;
            let mut results = Vec::with_capacity(operations.len());
            for op in operations {
                // Dropping `tx` on the error path rolls back.
                results.push(inner.apply(&tx, op)?);
            }
            tx.commit()?;
            Ok(results)
        })
        .await
    }

    async fn dump_store(&self, store: &str) -> StorageResult<Vec<Value>> {
        let store = store.to_string();
        run_blocking(&self.inner, move |inner| {
            let schema = inner.schema.store(&store)?;
            let records = inner.scan(&inner.lock_conn(), &schema)?;
            Ok(records.into_iter().map(|(_, record)| record).collect())
        })
        .await
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
        run_blocking(&self.inner, move |inner| inner.clear_store(&inner.lock_conn(), &store)).await
    }
}
