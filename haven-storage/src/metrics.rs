use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Estimated footprint of one store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMetrics {
    pub count: u64,
    /// Estimated payload bytes (`count * avg_item_size`).
    pub size: u64,
    pub avg_item_size: u64,
}

impl StoreMetrics {
    /// Extrapolates from the payload sizes of a sample of records.
    pub fn from_sample(count: u64, sample_sizes: &[u64]) -> Self {
        if sample_sizes.is_empty() {
            return Self { count, ..Self::default() };
        }
        let avg_item_size = sample_sizes.iter().sum::<u64>() / sample_sizes.len() as u64;
        Self {
            count,
            size: count * avg_item_size,
            avg_item_size,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMetrics {
    pub total_size: u64,
    pub per_store: BTreeMap<String, StoreMetrics>,
}

impl FromIterator<(String, StoreMetrics)> for StorageMetrics {
    fn from_iter<I: IntoIterator<Item = (String, StoreMetrics)>>(iter: I) -> Self {
        let per_store: BTreeMap<_, _> = iter.into_iter().collect();
        Self {
            total_size: per_store.values().map(|m| m.size).sum(),
            per_store,
        }
    }
}
