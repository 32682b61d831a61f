use crate::query::StorageQuery;
use serde_json::Value;

/// One step of a multi-operation transaction.
#[derive(Clone, Debug)]
pub enum StorageOperation {
    Create { store: String, value: Value },
    Read { store: String, key: Value },
    Update { store: String, key: Value, value: Value },
    Delete { store: String, key: Value },
    Query(StorageQuery),
}

impl StorageOperation {
    pub fn create(store: impl Into<String>, value: Value) -> Self {
        Self::Create { store: store.into(), value }
    }

    pub fn read(store: impl Into<String>, key: impl Into<Value>) -> Self {
        Self::Read { store: store.into(), key: key.into() }
    }

    pub fn update(store: impl Into<String>, key: impl Into<Value>, value: Value) -> Self {
        Self::Update { store: store.into(), key: key.into(), value }
    }

    pub fn delete(store: impl Into<String>, key: impl Into<Value>) -> Self {
        Self::Delete { store: store.into(), key: key.into() }
    }

    pub fn store(&self) -> &str {
        match self {
            Self::Create { store, .. }
            | Self::Read { store, .. }
            | Self::Update { store, .. }
            | Self::Delete { store, .. } => store,
            Self::Query(query) => &query.store,
        }
    }
}

/// Outcome of one [`StorageOperation`], in the same position as its operation.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationResult {
    Created(Value),
    Read(Option<Value>),
    Updated(Value),
    Deleted,
    Queried(Vec<Value>),
}

impl OperationResult {
    /// The single record this result carries, if any.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Created(v) | Self::Updated(v) => Some(v),
            Self::Read(v) => v,
            Self::Deleted | Self::Queried(_) => None,
        }
    }
}
