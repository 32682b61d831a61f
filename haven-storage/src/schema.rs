//! Schema definitions: databases, stores and indexes.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A key path is either one dotted field path or several (compound key).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    Single(String),
    Compound(Vec<String>),
}

impl KeyPath {
    pub fn is_compound(&self) -> bool {
        matches!(self, KeyPath::Compound(_))
    }

    fn is_empty(&self) -> bool {
        match self {
            KeyPath::Single(p) => p.is_empty(),
            KeyPath::Compound(parts) => parts.is_empty() || parts.iter().any(|p| p.is_empty()),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreIndex {
    pub name: String,
    pub key_path: KeyPath,
    #[serde(default)]
    pub unique: bool,
    /// Array values produce one index entry per element.
    #[serde(default)]
    pub multi_entry: bool,
}

impl StoreIndex {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: KeyPath::Single(key_path.into()),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn compound<I, S>(name: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            key_path: KeyPath::Compound(paths.into_iter().map(Into::into).collect()),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    /// Single-path, single-valued: one key per record at most.
    pub fn is_simple(&self) -> bool {
        !self.key_path.is_compound() && !self.multi_entry
    }
}

fn default_encrypted() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    pub name: String,
    /// Dotted path of the primary key inside each record.
    pub key_path: String,
    #[serde(default)]
    pub auto_generate: bool,
    #[serde(default)]
    pub indexes: Vec<StoreIndex>,
    /// Records are sealed into envelopes when a key is configured.
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            auto_generate: false,
            indexes: Vec::new(),
            encrypted: true,
        }
    }

    pub fn auto_generate(mut self) -> Self {
        self.auto_generate = true;
        self
    }

    pub fn plaintext(mut self) -> Self {
        self.encrypted = false;
        self
    }

    pub fn with_index(mut self, index: StoreIndex) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&StoreIndex> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Looks up an index, failing with a schema error if it is not declared.
    pub fn require_index(&self, name: &str) -> StorageResult<&StoreIndex> {
        self.index(name).ok_or_else(|| {
            StorageError::Schema(format!("store '{}' has no index '{name}'", self.name))
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSchema {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub stores: Vec<StoreSchema>,
}

/// What a newer schema version adds on top of the persisted one.
#[derive(Debug, Default)]
pub struct SchemaDiff {
    pub new_stores: Vec<StoreSchema>,
    /// (store name, index) pairs added to stores that already existed.
    pub new_indexes: Vec<(String, StoreIndex)>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.new_stores.is_empty() && self.new_indexes.is_empty()
    }
}

impl StorageSchema {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            stores: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: StoreSchema) -> Self {
        self.stores.push(store);
        self
    }

    pub fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.iter().find(|s| s.name == name)
    }

    /// Looks up a store, failing with a schema error if it is not declared.
    pub fn require_store(&self, name: &str) -> StorageResult<&StoreSchema> {
        self.store(name)
            .ok_or_else(|| StorageError::Schema(format!("unknown store '{name}'")))
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.name.clone()).collect()
    }

    /// Checks structural invariants: unique store names, unique index names
    /// per store, non-empty key paths, version at least 1.
    pub fn validate(&self) -> StorageResult<()> {
        if self.version == 0 {
            return Err(StorageError::Schema("schema version must be >= 1".into()));
        }
        let mut stores = HashSet::new();
        for store in &self.stores {
            if store.name.is_empty() {
                return Err(StorageError::Schema("store name must not be empty".into()));
            }
            if !stores.insert(store.name.as_str()) {
                return Err(StorageError::Schema(format!("duplicate store '{}'", store.name)));
            }
            if store.key_path.is_empty() {
                return Err(StorageError::Schema(format!(
                    "store '{}' has an empty key path",
                    store.name
                )));
            }
            let mut indexes = HashSet::new();
            for index in &store.indexes {
                if !indexes.insert(index.name.as_str()) {
                    return Err(StorageError::Schema(format!(
                        "duplicate index '{}' on store '{}'",
                        index.name, store.name
                    )));
                }
                if index.key_path.is_empty() {
                    return Err(StorageError::Schema(format!(
                        "index '{}' on store '{}' has an empty key path",
                        index.name, store.name
                    )));
                }
                if index.multi_entry && index.key_path.is_compound() {
                    return Err(StorageError::Schema(format!(
                        "index '{}' cannot be both compound and multi-entry",
                        index.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Computes the additive migration from `old` to `self`.
    ///
    /// Changing an existing store's key path or an existing index's definition
    /// is not additive and fails.
    pub fn additions_since(&self, old: &StorageSchema) -> StorageResult<SchemaDiff> {
        let mut diff = SchemaDiff::default();
        for store in &self.stores {
            let Some(previous) = old.store(&store.name) else {
                diff.new_stores.push(store.clone());
                continue;
            };
            if previous.key_path != store.key_path {
                return Err(StorageError::Schema(format!(
                    "store '{}' changed its key path ({} -> {})",
                    store.name, previous.key_path, store.key_path
                )));
            }
            for index in &store.indexes {
                match previous.index(&index.name) {
                    None => diff.new_indexes.push((store.name.clone(), index.clone())),
                    Some(existing) if existing != index => {
                        return Err(StorageError::Schema(format!(
                            "index '{}' on store '{}' changed definition",
                            index.name, store.name
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(diff)
    }

    /// The effective schema after migrating from `old`: everything in `self`,
    /// plus stores and indexes from `old` that `self` no longer mentions
    /// (nothing is ever dropped).
    pub fn merged_with(&self, old: &StorageSchema) -> StorageSchema {
        let mut merged = self.clone();
        for store in &mut merged.stores {
            if let Some(previous) = old.store(&store.name) {
                for index in &previous.indexes {
                    if store.index(&index.name).is_none() {
                        store.indexes.push(index.clone());
                    }
                }
            }
        }
        for previous in &old.stores {
            if merged.store(&previous.name).is_none() {
                merged.stores.push(previous.clone());
            }
        }
        merged
    }
}
