//! Storage error taxonomy.
//!
//! Every backend maps its native failures onto these five kinds at the
//! boundary, so callers never see `duckdb`, `rusqlite` or I/O errors directly.

use std::fmt;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Bad arguments, uninitialized backend, undecryptable record.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Missing store/table/index or schema version mismatch.
    #[error("schema error: {0}")]
    Schema(String),
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    QuotaExceeded,
    InvalidOperation,
    SchemaError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::InvalidOperation => "INVALID_OPERATION",
            ErrorCode::SchemaError => "SCHEMA_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StorageError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::NotFound(_) => ErrorCode::NotFound,
            StorageError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            StorageError::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            StorageError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            StorageError::Schema(_) => ErrorCode::SchemaError,
        }
    }

    pub(crate) fn record_not_found(store: &str, key: &serde_json::Value) -> Self {
        StorageError::NotFound(format!("{store}/{key}"))
    }

    pub(crate) fn record_exists(store: &str, key: &serde_json::Value) -> Self {
        StorageError::AlreadyExists(format!("{store}/{key}"))
    }

    pub(crate) fn unique_violation(store: &str, index: &str) -> Self {
        StorageError::AlreadyExists(format!("{store}: unique index '{index}' already holds this key"))
    }

    pub(crate) fn not_initialized() -> Self {
        StorageError::InvalidOperation("backend not initialized".to_string())
    }
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        let msg = e.to_string();
        if msg.contains("Catalog Error") || msg.contains("does not exist") {
            StorageError::Schema(format!("duckdb: {msg}"))
        } else if msg.contains("Constraint Error") {
            StorageError::AlreadyExists(format!("duckdb: {msg}"))
        } else if msg.contains("Out of Memory") || msg.contains("No space left") {
            StorageError::QuotaExceeded(format!("duckdb: {msg}"))
        } else {
            StorageError::InvalidOperation(format!("duckdb: {msg}"))
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode as Sqlite;
        if let rusqlite::Error::SqliteFailure(err, detail) = &e {
            let detail = detail.clone().unwrap_or_default();
            match err.code {
                Sqlite::ConstraintViolation => {
                    return StorageError::AlreadyExists(format!("sqlite: {detail}"));
                }
                Sqlite::DiskFull | Sqlite::OutOfMemory => {
                    return StorageError::QuotaExceeded(format!("sqlite: {detail}"));
                }
                _ if detail.contains("no such table") || detail.contains("no such column") => {
                    return StorageError::Schema(format!("sqlite: {detail}"));
                }
                _ => {}
            }
        }
        StorageError::InvalidOperation(format!("sqlite: {e}"))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::InvalidOperation(format!("serialization: {e}"))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::StorageFull {
            StorageError::QuotaExceeded(format!("io: {e}"))
        } else {
            StorageError::InvalidOperation(format!("io: {e}"))
        }
    }
}

impl From<haven_crypto::CryptoError> for StorageError {
    fn from(e: haven_crypto::CryptoError) -> Self {
        StorageError::InvalidOperation(format!("crypto: {e}"))
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::InvalidOperation(format!("storage task failed: {e}"))
    }
}
