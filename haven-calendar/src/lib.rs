//! Calendar synchronization for Haven.
//!
//! Events are kept in local storage and reconciled with an external calendar
//! service reached only through [`CalendarClient`]. A sync pulls incremental
//! changes per calendar using the service's sync tokens (falling back to a
//! full-window fetch when a token expires), merges them with local copies,
//! and pushes local edits back. [`SyncScheduler`] repeats that on an interval.
//!
//! Conflicts resolve by last modification: the later copy wins field by field,
//! and fields it lacks are filled from the other copy.

pub mod client;
mod config;
pub mod conflict;
mod error;
mod manager;
mod scheduler;
pub mod types;

pub use client::{CalendarClient, ClientError};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use manager::{PushSummary, SyncManager};
pub use scheduler::SyncScheduler;
pub use types::{
    Attendee, AttendeeResponse, AvailabilityRequest, AvailabilityResponse, Calendar,
    CalendarEvent, CalendarSyncInfo, EventStatus, EventsPage, SyncRequest, SyncResponse,
    SyncStatus, TimeSlot,
};
