//! The external calendar service, seen only through this trait.

use crate::types::{AvailabilityRequest, AvailabilityResponse, Calendar, CalendarEvent, EventsPage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The service no longer accepts the incremental-sync token.
    #[error("sync token expired")]
    SyncTokenExpired,

    #[error("remote event not found: {0}")]
    NotFound(String),

    #[error("calendar service rejected credentials")]
    Unauthorized,

    #[error("rate limited by calendar service")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("network error: {0}")]
    Network(String),

    #[error("calendar service error: {0}")]
    Remote(String),
}

#[async_trait]
pub trait CalendarClient: Send + Sync {
    async fn get_calendars(&self) -> Result<Vec<Calendar>, ClientError>;

    /// Changes since `sync_token`, or every event in `[time_min, time_max]`
    /// when no token is given.
    async fn get_events(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        sync_token: Option<&str>,
    ) -> Result<EventsPage, ClientError>;

    /// Returns the event as created, with its `remote_event_id` assigned.
    async fn create_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ClientError>;

    async fn update_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ClientError>;

    async fn delete_event(&self, calendar_id: &str, remote_event_id: &str) -> Result<bool, ClientError>;

    async fn check_availability(
        &self,
        request: &AvailabilityRequest,
    ) -> Result<AvailabilityResponse, ClientError>;
}
