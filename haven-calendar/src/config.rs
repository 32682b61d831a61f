//! Calendar sync configuration.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local writes grouped into one storage transaction.
    pub batch_size: usize,

    /// Days before now covered by a full sync.
    pub window_past_days: i64,

    /// Days after now covered by a full sync.
    pub window_future_days: i64,

    /// Seconds between scheduled sync cycles.
    pub sync_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            window_past_days: 30,
            window_future_days: 365,
            sync_interval_secs: 300, // 5 minutes
        }
    }
}

impl SyncConfig {
    pub fn sync_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync_interval_secs.max(1))
    }
}
