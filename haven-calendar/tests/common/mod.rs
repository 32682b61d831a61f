#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use haven_calendar::{
    AvailabilityRequest, AvailabilityResponse, Calendar, CalendarClient, CalendarEvent,
    ClientError, EventsPage, SyncConfig, SyncManager, TimeSlot,
};
use haven_storage::stores::application_schema;
use haven_storage::{BackendKind, Storage, StorageConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

// ── Mock Calendar Client ────────────────────────────────────────

pub struct MockCalendarClient {
    pub calendars: Vec<Calendar>,
    /// Results for get_events calls, in order. Once drained, calls return an
    /// empty page echoing the token they were given.
    pub pages: Mutex<VecDeque<Result<EventsPage, ClientError>>>,
    /// (calendar id, token) per get_events call.
    pub fetches: Mutex<Vec<(String, Option<String>)>>,
    pub created: Mutex<Vec<CalendarEvent>>,
    pub updated: Mutex<Vec<CalendarEvent>>,
    pub deleted: Mutex<Vec<(String, String)>>,
    next_remote_id: AtomicUsize,
    create_calls: AtomicUsize,
    /// 1-based create_event call that fails once with a network error; 0 = none.
    fail_create_call: AtomicUsize,
}

impl MockCalendarClient {
    pub fn new(calendar_ids: &[&str]) -> Self {
        Self {
            calendars: calendar_ids
                .iter()
                .enumerate()
                .map(|(i, id)| Calendar {
                    id: id.to_string(),
                    name: format!("Calendar {id}"),
                    primary: i == 0,
                    time_zone: None,
                })
                .collect(),
            pages: Mutex::new(VecDeque::new()),
            fetches: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            updated: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            next_remote_id: AtomicUsize::new(1),
            create_calls: AtomicUsize::new(0),
            fail_create_call: AtomicUsize::new(0),
        }
    }

    pub async fn push_page(&self, page: EventsPage) {
        self.pages.lock().await.push_back(Ok(page));
    }

    pub async fn push_error(&self, err: ClientError) {
        self.pages.lock().await.push_back(Err(err));
    }

    pub fn fail_nth_create(&self, n: usize) {
        self.fail_create_call.store(n, Ordering::SeqCst);
    }

    pub async fn fetch_count(&self) -> usize {
        self.fetches.lock().await.len()
    }
}

#[async_trait]
impl CalendarClient for MockCalendarClient {
    async fn get_calendars(&self) -> Result<Vec<Calendar>, ClientError> {
        Ok(self.calendars.clone())
    }

    async fn get_events(
        &self,
        calendar_id: &str,
        _time_min: DateTime<Utc>,
        _time_max: DateTime<Utc>,
        sync_token: Option<&str>,
    ) -> Result<EventsPage, ClientError> {
        self.fetches
            .lock()
            .await
            .push((calendar_id.to_string(), sync_token.map(String::from)));
        match self.pages.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(EventsPage {
                events: Vec::new(),
                sync_token: sync_token.map(String::from),
                deleted_event_ids: Vec::new(),
            }),
        }
    }

    async fn create_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ClientError> {
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .fail_create_call
            .compare_exchange(call, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Err(ClientError::Network("connection dropped".into()));
        }
        let n = self.next_remote_id.fetch_add(1, Ordering::SeqCst);
        let mut created = event.clone();
        created.remote_event_id = Some(format!("remote-{n}"));
        self.created.lock().await.push(created.clone());
        Ok(created)
    }

    async fn update_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ClientError> {
        self.updated.lock().await.push(event.clone());
        Ok(event.clone())
    }

    async fn delete_event(&self, calendar_id: &str, remote_event_id: &str) -> Result<bool, ClientError> {
        self.deleted
            .lock()
            .await
            .push((calendar_id.to_string(), remote_event_id.to_string()));
        Ok(true)
    }

    async fn check_availability(
        &self,
        request: &AvailabilityRequest,
    ) -> Result<AvailabilityResponse, ClientError> {
        Ok(AvailabilityResponse {
            time_slots: vec![TimeSlot {
                start: request.time_min,
                end: request.time_max,
                available: true,
            }],
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────

/// Log output for a failing test: `RUST_LOG=haven_calendar=debug`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn at_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

/// A remote event as the service would report it: no local id or user.
pub fn remote_event(remote_id: &str, title: &str, modified: DateTime<Utc>) -> CalendarEvent {
    let start = Utc::now() + Duration::days(1);
    let start = at_ms(start.timestamp_millis());
    let mut event = CalendarEvent::new("", "primary", title, start, start + Duration::hours(1));
    event.remote_event_id = Some(remote_id.to_string());
    event.last_modified = at_ms(modified.timestamp_millis());
    event
}

pub fn page(events: Vec<CalendarEvent>, token: &str) -> EventsPage {
    EventsPage {
        events,
        sync_token: Some(token.to_string()),
        deleted_event_ids: Vec::new(),
    }
}

pub async fn open_storage(kind: BackendKind) -> Storage {
    Storage::initialize(StorageConfig::in_memory(kind), &application_schema(), None)
        .await
        .unwrap()
}

pub async fn manager_with(
    kind: BackendKind,
    config: SyncConfig,
    calendar_ids: &[&str],
) -> (SyncManager, Arc<MockCalendarClient>) {
    init_tracing();
    let client = Arc::new(MockCalendarClient::new(calendar_ids));
    let manager = SyncManager::new(open_storage(kind).await, client.clone(), config);
    (manager, client)
}

pub async fn manager() -> (SyncManager, Arc<MockCalendarClient>) {
    manager_with(BackendKind::Relational, SyncConfig::default(), &["primary"]).await
}
