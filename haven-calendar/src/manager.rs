//! Synchronization between local storage and the calendar service.
//!
//! Pull: per calendar, fetch incremental changes (or the full window), merge
//! each changed event with its local copy, delete what the service deleted,
//! and write in batches. Push: send local edits made since the last sync and
//! back-fill remote ids. Sync state per user lives in the sync-info store.

use crate::client::{CalendarClient, ClientError};
use crate::config::SyncConfig;
use crate::conflict;
use crate::error::{SyncError, SyncResult};
use crate::types::{
    AvailabilityRequest, AvailabilityResponse, CalendarEvent, CalendarSyncInfo, EventsPage,
    SyncRequest, SyncResponse, SyncStatus,
};
use chrono::{DateTime, Duration, Utc};
use haven_storage::stores::{indexes, CALENDAR_EVENTS, CALENDAR_SYNC_INFO};
use haven_storage::{KeyRange, Storage, StorageError, StorageOperation, StorageQuery};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Counts from one push.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub created: usize,
    pub updated: usize,
}

/// Local changes produced while applying one calendar's page.
#[derive(Default)]
struct PageChanges {
    writes: Vec<StorageOperation>,
    events: Vec<CalendarEvent>,
    deleted: Vec<String>,
}

#[derive(Clone)]
pub struct SyncManager {
    storage: Storage,
    client: Arc<dyn CalendarClient>,
    config: SyncConfig,
}

impl SyncManager {
    pub fn new(storage: Storage, client: Arc<dyn CalendarClient>, config: SyncConfig) -> Self {
        Self {
            storage,
            client,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // ── Sync state ───────────────────────────────────────────────

    /// The user's sync state, created and persisted on first access.
    pub async fn sync_info(&self, user_id: &str) -> SyncResult<CalendarSyncInfo> {
        if let Some(info) = self
            .storage
            .read_as::<CalendarSyncInfo>(CALENDAR_SYNC_INFO, user_id)
            .await?
        {
            return Ok(info);
        }
        let info = CalendarSyncInfo::new(user_id);
        match self
            .storage
            .create(CALENDAR_SYNC_INFO, serde_json::to_value(&info)?)
            .await
        {
            Ok(_) => Ok(info),
            // Created concurrently by another caller.
            Err(StorageError::AlreadyExists(_)) => self
                .storage
                .read_as::<CalendarSyncInfo>(CALENDAR_SYNC_INFO, user_id)
                .await?
                .ok_or_else(|| SyncError::Storage(StorageError::NotFound(user_id.to_string()))),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_sync_info(&self, info: &CalendarSyncInfo) -> SyncResult<()> {
        self.storage
            .update(
                CALENDAR_SYNC_INFO,
                info.user_id.as_str(),
                serde_json::to_value(info)?,
            )
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, user_id: &str, status: SyncStatus) -> SyncResult<()> {
        let mut info = self.sync_info(user_id).await?;
        info.status = status;
        if status != SyncStatus::Error {
            info.error = None;
        }
        self.save_sync_info(&info).await
    }

    async fn record_failure(&self, info: &mut CalendarSyncInfo, err: &SyncError) {
        info.status = SyncStatus::Error;
        info.error = Some(err.to_string());
        if let Err(save_err) = self.save_sync_info(info).await {
            error!(user_id = %info.user_id, error = %save_err, "failed to record sync failure");
        }
    }

    // ── Pull ─────────────────────────────────────────────────────

    /// Pulls remote changes for the requested calendars into local storage.
    ///
    /// Progress made for earlier calendars is kept if a later one fails.
    pub async fn sync(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        let mut info = self.sync_info(&request.user_id).await?;
        info.status = SyncStatus::Syncing;
        info.error = None;
        self.save_sync_info(&info).await?;
        info!(user_id = %request.user_id, full = request.full_sync, "calendar sync started");

        match self.pull(request, &mut info).await {
            Ok(response) => {
                info.status = SyncStatus::Synced;
                info.last_sync_time = Some(response.timestamp);
                info.sync_token = response.sync_token.clone();
                self.save_sync_info(&info).await?;
                info!(
                    user_id = %request.user_id,
                    changed = response.events.len(),
                    deleted = response.deleted_event_ids.len(),
                    "calendar sync finished"
                );
                Ok(response)
            }
            Err(e) => {
                error!(user_id = %request.user_id, error = %e, "calendar sync failed");
                self.record_failure(&mut info, &e).await;
                Err(e)
            }
        }
    }

    async fn pull(&self, request: &SyncRequest, info: &mut CalendarSyncInfo) -> SyncResult<SyncResponse> {
        let calendar_ids = if request.calendar_ids.is_empty() {
            self.client
                .get_calendars()
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect()
        } else {
            request.calendar_ids.clone()
        };
        let now = Utc::now();
        let time_min = request
            .time_min
            .unwrap_or(now - Duration::days(self.config.window_past_days));
        let time_max = request
            .time_max
            .unwrap_or(now + Duration::days(self.config.window_future_days));

        let mut response = SyncResponse {
            user_id: request.user_id.clone(),
            sync_token: None,
            events: Vec::new(),
            deleted_event_ids: Vec::new(),
            timestamp: now,
        };

        for calendar_id in &calendar_ids {
            let token = if request.full_sync {
                None
            } else {
                info.sync_tokens
                    .get(calendar_id)
                    .cloned()
                    .or_else(|| request.sync_token.clone())
            };
            let page = self
                .fetch_page(calendar_id, time_min, time_max, token.as_deref())
                .await?;
            let new_token = page.sync_token.clone();

            let changes = self.apply_page(&request.user_id, calendar_id, page).await?;
            self.write_batches(changes.writes).await?;

            if let Some(token) = &new_token {
                info.sync_tokens.insert(calendar_id.clone(), token.clone());
            }
            response.sync_token = new_token.or(response.sync_token);
            response.events.extend(changes.events);
            response.deleted_event_ids.extend(changes.deleted);
        }
        response.timestamp = Utc::now();
        Ok(response)
    }

    /// Fetches one calendar, falling back to a full-window fetch once if the
    /// service rejects the token.
    async fn fetch_page(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        token: Option<&str>,
    ) -> SyncResult<EventsPage> {
        match self.client.get_events(calendar_id, time_min, time_max, token).await {
            Err(ClientError::SyncTokenExpired) if token.is_some() => {
                warn!(calendar_id, "sync token expired, falling back to full sync");
                Ok(self.client.get_events(calendar_id, time_min, time_max, None).await?)
            }
            other => Ok(other?),
        }
    }

    async fn apply_page(&self, user_id: &str, calendar_id: &str, page: EventsPage) -> SyncResult<PageChanges> {
        let now = Utc::now();
        let mut changes = PageChanges::default();

        for mut remote in page.events {
            remote.user_id = user_id.to_string();
            if remote.calendar_id.is_empty() {
                remote.calendar_id = calendar_id.to_string();
            }

            match self.find_local(&remote).await? {
                None => {
                    if remote.id.is_empty() {
                        remote.id = uuid::Uuid::now_v7().to_string();
                    }
                    remote.last_synced = Some(now);
                    changes
                        .writes
                        .push(StorageOperation::create(CALENDAR_EVENTS, serde_json::to_value(&remote)?));
                    changes.events.push(remote);
                }
                Some(local) => {
                    let mut merged = conflict::resolve(&local, &remote)?;
                    merged.last_synced = local.last_synced;
                    if merged == local {
                        continue;
                    }
                    merged.last_synced = Some(now);
                    changes.writes.push(StorageOperation::update(
                        CALENDAR_EVENTS,
                        merged.id.as_str(),
                        serde_json::to_value(&merged)?,
                    ));
                    changes.events.push(merged);
                }
            }
        }

        for remote_id in page.deleted_event_ids {
            for local in self.find_by_remote_id(&remote_id).await? {
                changes
                    .writes
                    .push(StorageOperation::delete(CALENDAR_EVENTS, local.id.as_str()));
            }
            changes.deleted.push(remote_id);
        }
        Ok(changes)
    }

    /// Local copy of a remote event: by remote id first, then by local id.
    async fn find_local(&self, remote: &CalendarEvent) -> SyncResult<Option<CalendarEvent>> {
        if let Some(remote_id) = &remote.remote_event_id {
            if let Some(local) = self.find_by_remote_id(remote_id).await?.into_iter().next() {
                return Ok(Some(local));
            }
        }
        if remote.id.is_empty() {
            return Ok(None);
        }
        Ok(self
            .storage
            .read_as::<CalendarEvent>(CALENDAR_EVENTS, remote.id.as_str())
            .await?)
    }

    async fn find_by_remote_id(&self, remote_id: &str) -> SyncResult<Vec<CalendarEvent>> {
        let query = StorageQuery::new(CALENDAR_EVENTS)
            .index(indexes::EVENT_BY_REMOTE_ID)
            .range(KeyRange::only(remote_id));
        Ok(self.storage.query_as(&query).await?)
    }

    /// Applies writes in `batch_size` transactions, strictly one after another.
    async fn write_batches(&self, writes: Vec<StorageOperation>) -> SyncResult<()> {
        let total = writes.len();
        let batch_size = self.config.batch_size.max(1);
        let mut pending = writes.into_iter().peekable();
        let mut batch_no = 0;
        while pending.peek().is_some() {
            let batch: Vec<_> = pending.by_ref().take(batch_size).collect();
            batch_no += 1;
            debug!(batch = batch_no, size = batch.len(), total, "applying sync batch");
            self.storage.transaction(batch).await?;
        }
        Ok(())
    }

    // ── Push ─────────────────────────────────────────────────────

    /// Sends local edits made since the last sync to the calendar service.
    pub async fn push_changes(&self, user_id: &str) -> SyncResult<PushSummary> {
        let mut info = self.sync_info(user_id).await?;
        match self.push(&info).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(user_id, error = %e, "calendar push failed");
                self.record_failure(&mut info, &e).await;
                Err(e)
            }
        }
    }

    /// Sends each changed event, then writes back remote ids and sync stamps.
    ///
    /// Events the service already accepted are written back even when a later
    /// remote call fails, so the next push never re-creates them.
    async fn push(&self, info: &CalendarSyncInfo) -> SyncResult<PushSummary> {
        let query = StorageQuery::new(CALENDAR_EVENTS)
            .index(indexes::EVENT_BY_USER)
            .range(KeyRange::only(info.user_id.as_str()));
        let events: Vec<CalendarEvent> = self.storage.query_as(&query).await?;

        let mut summary = PushSummary::default();
        let mut writes = Vec::new();
        let mut failure = None;
        for event in events {
            let changed_since_sync = info.last_sync_time.is_none_or(|t| event.last_modified > t);
            if !changed_since_sync || !event.has_unsynced_changes() {
                continue;
            }
            let was_new = event.remote_event_id.is_none();
            match self.push_event(event).await {
                Ok(pushed) => {
                    if was_new {
                        summary.created += 1;
                    } else {
                        summary.updated += 1;
                    }
                    writes.push(StorageOperation::update(
                        CALENDAR_EVENTS,
                        pushed.id.as_str(),
                        serde_json::to_value(&pushed)?,
                    ));
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.write_batches(writes).await?;
        if summary != PushSummary::default() {
            info!(user_id = %info.user_id, created = summary.created, updated = summary.updated, "pushed local calendar changes");
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Creates or updates one event remotely, returning the local copy to save.
    async fn push_event(&self, mut event: CalendarEvent) -> SyncResult<CalendarEvent> {
        if event.remote_event_id.is_none() {
            let created = self.client.create_event(&event).await?;
            let remote_id = created.remote_event_id.ok_or_else(|| {
                SyncError::InvalidEvent(format!("service returned no remote id for {}", event.id))
            })?;
            event.remote_event_id = Some(remote_id);
        } else {
            self.client.update_event(&event).await?;
        }
        event.last_synced = Some(Utc::now());
        Ok(event)
    }

    /// Push, then pull. One scheduled cycle.
    pub async fn sync_cycle(&self, request: &SyncRequest) -> SyncResult<SyncResponse> {
        self.push_changes(&request.user_id).await?;
        self.sync(request).await
    }

    // ── Local edits ──────────────────────────────────────────────

    /// Saves a local edit, stamping `last_modified` so the next push sends it.
    pub async fn save_local_event(&self, mut event: CalendarEvent) -> SyncResult<CalendarEvent> {
        if event.end_time < event.start_time {
            return Err(SyncError::InvalidEvent(format!(
                "event '{}' ends before it starts",
                event.title
            )));
        }
        event.last_modified = Utc::now();
        if event.id.is_empty() {
            event.id = uuid::Uuid::now_v7().to_string();
            self.storage
                .create(CALENDAR_EVENTS, serde_json::to_value(&event)?)
                .await?;
            return Ok(event);
        }
        let exists = self
            .storage
            .read(CALENDAR_EVENTS, event.id.as_str())
            .await?
            .is_some();
        let value = serde_json::to_value(&event)?;
        if exists {
            self.storage.update(CALENDAR_EVENTS, event.id.as_str(), value).await?;
        } else {
            self.storage.create(CALENDAR_EVENTS, value).await?;
        }
        Ok(event)
    }

    /// Deletes remotely (when the event was ever pushed), then locally.
    pub async fn delete_event(&self, event_id: &str) -> SyncResult<()> {
        let event = self
            .storage
            .read_as::<CalendarEvent>(CALENDAR_EVENTS, event_id)
            .await?
            .ok_or_else(|| SyncError::EventNotFound(event_id.to_string()))?;
        if let Some(remote_id) = &event.remote_event_id {
            match self.client.delete_event(&event.calendar_id, remote_id).await {
                Ok(_) | Err(ClientError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.storage.delete(CALENDAR_EVENTS, event_id).await?;
        Ok(())
    }

    pub async fn get_event(&self, event_id: &str) -> SyncResult<Option<CalendarEvent>> {
        Ok(self
            .storage
            .read_as::<CalendarEvent>(CALENDAR_EVENTS, event_id)
            .await?)
    }

    /// A user's events starting within `[from, to]`, ordered by start time.
    pub async fn list_events(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SyncResult<Vec<CalendarEvent>> {
        let owner = user_id.to_string();
        let query = StorageQuery::new(CALENDAR_EVENTS)
            .index(indexes::EVENT_BY_START)
            .range(KeyRange::bound(from.timestamp_millis(), to.timestamp_millis()))
            .filter(move |event| event["userId"].as_str() == Some(owner.as_str()));
        Ok(self.storage.query_as(&query).await?)
    }

    pub async fn check_availability(
        &self,
        request: &AvailabilityRequest,
    ) -> SyncResult<AvailabilityResponse> {
        Ok(self.client.check_availability(request).await?)
    }
}
