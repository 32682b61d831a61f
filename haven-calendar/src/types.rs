//! Calendar data types, stored and exchanged as camelCase JSON with
//! millisecond timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttendeeResponse {
    #[default]
    NeedsAction,
    Accepted,
    Declined,
    Tentative,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub response: AttendeeResponse,
}

impl Attendee {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
            response: AttendeeResponse::default(),
        }
    }
}

/// A calendar event as kept on the device.
///
/// `id` is the local identity and never changes; `remote_event_id` is filled
/// once the event exists on the calendar service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub calendar_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_event_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default)]
    pub agent_created: bool,
    #[serde(default)]
    pub attendees: Vec<Attendee>,
    /// RFC 5545 recurrence rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_synced: Option<DateTime<Utc>>,
}

impl CalendarEvent {
    /// A new local event; the id is assigned when it is saved.
    pub fn new(
        user_id: impl Into<String>,
        calendar_id: impl Into<String>,
        title: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: String::new(),
            user_id: user_id.into(),
            calendar_id: calendar_id.into(),
            remote_event_id: None,
            title: title.into(),
            description: String::new(),
            start_time,
            end_time,
            location: None,
            status: EventStatus::Confirmed,
            agent_created: false,
            attendees: Vec::new(),
            recurrence: None,
            last_modified: Utc::now(),
            last_synced: None,
        }
    }

    /// Modified since it was last pushed or pulled.
    pub fn has_unsynced_changes(&self) -> bool {
        self.last_synced.is_none_or(|synced| self.last_modified > synced)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    #[default]
    NotConnected,
    Syncing,
    Synced,
    Error,
}

/// Per-user sync state, created lazily on the first sync attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarSyncInfo {
    pub user_id: String,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Token returned for the last calendar synced.
    #[serde(default)]
    pub sync_token: Option<String>,
    /// Incremental-sync token per calendar id.
    #[serde(default)]
    pub sync_tokens: BTreeMap<String, String>,
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl CalendarSyncInfo {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub user_id: String,
    /// Calendars to sync; empty means every calendar the client reports.
    #[serde(default)]
    pub calendar_ids: Vec<String>,
    /// Ignore stored tokens and re-fetch the whole window.
    #[serde(default)]
    pub full_sync: bool,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub time_min: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub time_max: Option<DateTime<Utc>>,
    /// Token to use for calendars without a stored one.
    #[serde(default)]
    pub sync_token: Option<String>,
}

impl SyncRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn calendars<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.calendar_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn full(mut self) -> Self {
        self.full_sync = true;
        self
    }

    pub fn window(mut self, time_min: DateTime<Utc>, time_max: DateTime<Utc>) -> Self {
        self.time_min = Some(time_min);
        self.time_max = Some(time_max);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub user_id: String,
    pub sync_token: Option<String>,
    /// Remote changes as stored locally after conflict resolution.
    pub events: Vec<CalendarEvent>,
    pub deleted_event_ids: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// One page of remote changes for a calendar.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub events: Vec<CalendarEvent>,
    pub sync_token: Option<String>,
    #[serde(default)]
    pub deleted_event_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calendar {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityRequest {
    pub calendar_ids: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time_min: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time_max: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end: DateTime<Utc>,
    pub available: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub time_slots: Vec<TimeSlot>,
}
