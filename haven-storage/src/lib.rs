//! Local storage for Haven.
//!
//! Every user, agent, conversation and calendar record lives on the device.
//! Three interchangeable backends implement one contract:
//!
//! - [`ObjectStoreBackend`] on DuckDB, with per-field index entries
//! - [`RelationalBackend`] on SQLite, one table per store with real rollback
//! - [`KeyValueBackend`] over a flat key-value area, for environments without
//!   an embedded database
//!
//! Callers pick one through [`StorageConfig::backend`] and talk to the
//! [`Storage`] handle. Records of encrypted stores are sealed into envelopes
//! before they reach the engine; index keys stay plaintext (order-preserving
//! encoded) so range scans never decrypt.
//!
//! # Migrations
//!
//! Schemas are versioned. Opening with the persisted version is a no-op, a
//! higher version adds stores and indexes (back-filling new indexes), and a
//! lower version fails with a schema error. Nothing is ever dropped.

pub mod backend;
mod backup;
mod codec;
mod config;
mod error;
pub mod key_codec;
pub mod key_path;
mod metrics;
mod operation;
mod query;
mod schema;
mod storage;
pub mod stores;

pub use backend::kv::{FileArea, KeyValueArea, KeyValueBackend, KvWrite, MemoryArea};
pub use backend::object_store::{open_duckdb_with_wal_recovery, ObjectStoreBackend};
pub use backend::relational::RelationalBackend;
pub use backend::{StorageBackend, TransactionSupport};
pub use backup::{SealedBackup, StorageBackup};
pub use codec::RecordCodec;
pub use config::{BackendKind, StorageConfig};
pub use error::{ErrorCode, StorageError, StorageResult};
pub use metrics::{StorageMetrics, StoreMetrics};
pub use operation::{OperationResult, StorageOperation};
pub use query::{Direction, EncodedRange, KeyRange, RecordFilter, StorageQuery};
pub use schema::{KeyPath, SchemaDiff, StorageSchema, StoreIndex, StoreSchema};
pub use storage::{open_backend, Storage};
