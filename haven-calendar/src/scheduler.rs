//! Periodic background sync, at most one loop per user.

use crate::error::SyncResult;
use crate::manager::SyncManager;
use crate::types::{SyncRequest, SyncStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct ScheduledSync {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Runs [`SyncManager::sync_cycle`] for each started user on the configured
/// interval.
///
/// Stopping only prevents further cycles. A cycle already in flight runs to
/// completion and may record its own status after the stop.
#[derive(Clone)]
pub struct SyncScheduler {
    manager: SyncManager,
    tasks: Arc<Mutex<HashMap<String, ScheduledSync>>>,
}

impl SyncScheduler {
    pub fn new(manager: SyncManager) -> Self {
        Self {
            manager,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    /// Lock the task table, recovering from a poisoned mutex.
    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, ScheduledSync>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts syncing `request.user_id` now and then every interval,
    /// replacing any loop already running for that user.
    ///
    /// Cycle failures are logged and recorded in the user's sync status; they
    /// never reach the caller. Must be called from within a Tokio runtime.
    pub fn start(&self, request: SyncRequest) {
        let user_id = request.user_id.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let manager = self.manager.clone();
        let interval = manager.config().sync_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                debug!(user_id = %request.user_id, "scheduled calendar sync");
                if let Err(e) = manager.sync_cycle(&request).await {
                    warn!(user_id = %request.user_id, error = %e, "scheduled calendar sync failed");
                }
            }
            debug!(user_id = %request.user_id, "calendar sync loop stopped");
        });

        let previous = self
            .lock_tasks()
            .insert(user_id.clone(), ScheduledSync { stop_tx, handle });
        if let Some(previous) = previous {
            let _ = previous.stop_tx.send(());
            debug!(%user_id, "replaced running calendar sync loop");
        }
        info!(%user_id, every_secs = interval.as_secs(), "calendar sync scheduled");
    }

    /// Stops the user's loop and marks them not connected. Returns whether a
    /// loop was running. Does not wait for an in-flight cycle.
    pub async fn stop(&self, user_id: &str) -> SyncResult<bool> {
        let Some(task) = self.lock_tasks().remove(user_id) else {
            return Ok(false);
        };
        let _ = task.stop_tx.send(());
        self.manager
            .set_status(user_id, SyncStatus::NotConnected)
            .await?;
        info!(user_id, "calendar sync stopped");
        Ok(true)
    }

    pub async fn stop_all(&self) -> SyncResult<()> {
        let users: Vec<String> = self.lock_tasks().keys().cloned().collect();
        for user_id in users {
            self.stop(&user_id).await?;
        }
        Ok(())
    }

    /// Whether a loop is registered for the user and its task has not exited.
    pub fn is_running(&self, user_id: &str) -> bool {
        self.lock_tasks()
            .get(user_id)
            .is_some_and(|task| !task.handle.is_finished())
    }
}
