//! Sync error types.

use crate::client::ClientError;
use haven_storage::StorageError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("calendar client error: {0}")]
    Client(#[from] ClientError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event not found: {0}")]
    EventNotFound(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),
}
