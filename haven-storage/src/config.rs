//! Storage configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which backend implementation serves the storage contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// DuckDB-backed object store with per-field index entries.
    #[default]
    ObjectStore,
    /// SQLite, one table per store, real transactions.
    Relational,
    /// Flat key-value area for environments without an embedded database.
    KeyValue,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::ObjectStore => write!(f, "object_store"),
            BackendKind::Relational => write!(f, "relational"),
            BackendKind::KeyValue => write!(f, "key_value"),
        }
    }
}

/// Configuration for opening a [`crate::Storage`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,

    /// Database (or key-value file) location. `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// DuckDB memory cap (object-store backend).
    pub memory_limit: String,

    /// DuckDB worker threads (object-store backend).
    pub threads: u32,

    /// Key prefix separating this database inside a shared key-value area.
    pub kv_namespace: String,

    /// Maximum bytes the key-value area may hold. `None` means unbounded.
    pub kv_quota_bytes: Option<u64>,

    /// Records sampled per store when estimating metrics.
    pub metrics_sample_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::ObjectStore,
            path: None,
            memory_limit: "256MB".to_string(),
            threads: 2,
            kv_namespace: "haven".to_string(),
            kv_quota_bytes: Some(5 * 1024 * 1024),
            metrics_sample_size: 100,
        }
    }
}

impl StorageConfig {
    /// In-memory configuration for the given backend.
    pub fn in_memory(backend: BackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    /// On-disk configuration for the given backend.
    pub fn at_path(backend: BackendKind, path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            path: Some(path.into()),
            ..Self::default()
        }
    }
}
