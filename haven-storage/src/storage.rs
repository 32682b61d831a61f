//! The `Storage` handle: the one contract the rest of the application uses.

use crate::backend::kv::KeyValueBackend;
use crate::backend::object_store::ObjectStoreBackend;
use crate::backend::relational::RelationalBackend;
use crate::backend::{StorageBackend, TransactionSupport};
use crate::backup::StorageBackup;
use crate::config::{BackendKind, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::metrics::StorageMetrics;
use crate::operation::{OperationResult, StorageOperation};
use crate::query::StorageQuery;
use crate::schema::StorageSchema;
use haven_crypto::{DataEncryptor, DerivedKey, KeyedEncryptor, PassthroughEncryptor};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Opens the backend `config` selects, without initializing a schema.
pub fn open_backend(
    config: &StorageConfig,
    encryptor: Arc<dyn DataEncryptor>,
) -> StorageResult<Arc<dyn StorageBackend>> {
    Ok(match config.backend {
        BackendKind::ObjectStore => Arc::new(ObjectStoreBackend::from_config(config, encryptor)?),
        BackendKind::Relational => Arc::new(RelationalBackend::from_config(config, encryptor)?),
        BackendKind::KeyValue => Arc::new(KeyValueBackend::from_config(config, encryptor)?),
    })
}

/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
    config: StorageConfig,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("backend", &self.backend.kind())
            .field("path", &self.config.path)
            .finish()
    }
}

impl Storage {
    /// Opens the configured backend and provisions `schema`. With a key, stores
    /// marked encrypted are sealed at rest.
    pub async fn initialize(
        config: StorageConfig,
        schema: &StorageSchema,
        key: Option<DerivedKey>,
    ) -> StorageResult<Self> {
        let encryptor: Arc<dyn DataEncryptor> = match key {
            Some(key) => Arc::new(KeyedEncryptor::new(key)),
            None => Arc::new(PassthroughEncryptor),
        };
        Self::initialize_with_encryptor(config, schema, encryptor).await
    }

    pub async fn initialize_with_encryptor(
        config: StorageConfig,
        schema: &StorageSchema,
        encryptor: Arc<dyn DataEncryptor>,
    ) -> StorageResult<Self> {
        let open_config = config.clone();
        let backend =
            tokio::task::spawn_blocking(move || open_backend(&open_config, encryptor)).await??;
        info!(backend = %config.backend, in_memory = config.path.is_none(), "storage opened");
        Self::with_backend(backend, config, schema).await
    }

    /// Wraps an already-opened backend.
    pub async fn with_backend(
        backend: Arc<dyn StorageBackend>,
        config: StorageConfig,
        schema: &StorageSchema,
    ) -> StorageResult<Self> {
        backend.initialize(schema).await?;
        Ok(Self { backend, config })
    }

    /// Re-initializes with a newer schema version (additive migration).
    pub async fn migrate(&self, schema: &StorageSchema) -> StorageResult<()> {
        self.backend.initialize(schema).await
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn transaction_support(&self) -> TransactionSupport {
        self.backend.transaction_support()
    }

    pub fn schema(&self) -> StorageResult<Arc<StorageSchema>> {
        self.backend.schema()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub async fn create(&self, store: &str, item: Value) -> StorageResult<Value> {
        self.backend.create(store, item).await
    }

    pub async fn read(&self, store: &str, key: impl Into<Value>) -> StorageResult<Option<Value>> {
        self.backend.read(store, &key.into()).await
    }

    pub async fn read_as<T: DeserializeOwned>(
        &self,
        store: &str,
        key: impl Into<Value>,
    ) -> StorageResult<Option<T>> {
        self.read(store, key)
            .await?
            .map(|value| serde_json::from_value(value).map_err(StorageError::from))
            .transpose()
    }

    pub async fn update(&self, store: &str, key: impl Into<Value>, item: Value) -> StorageResult<Value> {
        self.backend.update(store, &key.into(), item).await
    }

    pub async fn delete(&self, store: &str, key: impl Into<Value>) -> StorageResult<()> {
        self.backend.delete(store, &key.into()).await
    }

    pub async fn query(&self, query: &StorageQuery) -> StorageResult<Vec<Value>> {
        self.backend.query(query).await
    }

    pub async fn query_as<T: DeserializeOwned>(&self, query: &StorageQuery) -> StorageResult<Vec<T>> {
        self.query(query)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(StorageError::from))
            .collect()
    }

    /// Runs `operations` in order. Whether a failure rolls back earlier steps
    /// depends on [`Storage::transaction_support`].
    pub async fn transaction(
        &self,
        operations: Vec<StorageOperation>,
    ) -> StorageResult<Vec<OperationResult>> {
        self.backend.transaction(operations).await
    }

    /// Like [`Storage::transaction`], but refuses backends that cannot roll back.
    pub async fn transaction_atomic(
        &self,
        operations: Vec<StorageOperation>,
    ) -> StorageResult<Vec<OperationResult>> {
        if self.transaction_support() != TransactionSupport::Atomic {
            return Err(StorageError::InvalidOperation(format!(
                "{} backend does not support atomic transactions",
                self.kind()
            )));
        }
        self.transaction(operations).await
    }

    pub async fn backup(&self, user_id: &str) -> StorageResult<StorageBackup> {
        self.backend.backup(user_id).await
    }

    pub async fn restore(&self, backup: &StorageBackup) -> StorageResult<()> {
        self.backend.restore(backup).await
    }

    /// Writes a plaintext JSON backup to `path`.
    pub async fn backup_to_file(&self, user_id: &str, path: &Path) -> StorageResult<StorageBackup> {
        let backup = self.backup(user_id).await?;
        tokio::fs::write(path, backup.to_json()?).await?;
        Ok(backup)
    }

    pub async fn restore_from_file(&self, path: &Path) -> StorageResult<StorageBackup> {
        let json = tokio::fs::read_to_string(path).await?;
        let backup = StorageBackup::from_json(&json)?;
        self.restore(&backup).await?;
        Ok(backup)
    }

    pub async fn metrics(&self) -> StorageResult<StorageMetrics> {
        self.backend.metrics(self.config.metrics_sample_size).await
    }

    pub async fn clear_store(&self, store: &str) -> StorageResult<()> {
        self.backend.clear_store(store).await
    }

    pub async fn clear_all(&self) -> StorageResult<()> {
        self.backend.clear_all().await
    }
}
