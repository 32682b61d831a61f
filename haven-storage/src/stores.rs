//! The application's store layout.

use crate::schema::{StorageSchema, StoreIndex, StoreSchema};

pub const DATABASE_NAME: &str = "haven";
pub const SCHEMA_VERSION: u32 = 1;

pub const USERS: &str = "users";
pub const AGENTS: &str = "agents";
pub const CONVERSATIONS: &str = "conversations";
pub const MESSAGES: &str = "messages";
pub const CALENDAR_EVENTS: &str = "calendar_events";
pub const CALENDAR_SYNC_INFO: &str = "calendar_sync_info";

pub mod indexes {
    pub const USER_BY_EMAIL: &str = "by_email";
    pub const AGENT_BY_USER: &str = "by_user";
    pub const CONVERSATION_BY_USER: &str = "by_user";
    pub const CONVERSATION_BY_UPDATED: &str = "by_updated";
    pub const MESSAGE_BY_CONVERSATION: &str = "by_conversation";
    pub const MESSAGE_BY_TIMESTAMP: &str = "by_timestamp";
    pub const EVENT_BY_REMOTE_ID: &str = "by_remote_id";
    pub const EVENT_BY_CALENDAR: &str = "by_calendar";
    pub const EVENT_BY_START: &str = "by_start";
    pub const EVENT_BY_USER: &str = "by_user";
}

/// Schema for every store Haven keeps on device.
pub fn application_schema() -> StorageSchema {
    use indexes::*;

    StorageSchema::new(DATABASE_NAME, SCHEMA_VERSION)
        .with_store(
            StoreSchema::new(USERS, "id")
                .with_index(StoreIndex::new(USER_BY_EMAIL, "email").unique()),
        )
        .with_store(
            StoreSchema::new(AGENTS, "id")
                .auto_generate()
                .with_index(StoreIndex::new(AGENT_BY_USER, "userId")),
        )
        .with_store(
            StoreSchema::new(CONVERSATIONS, "id")
                .auto_generate()
                .with_index(StoreIndex::new(CONVERSATION_BY_USER, "userId"))
                .with_index(StoreIndex::new(CONVERSATION_BY_UPDATED, "updatedAt")),
        )
        .with_store(
            StoreSchema::new(MESSAGES, "id")
                .auto_generate()
                .with_index(StoreIndex::new(MESSAGE_BY_CONVERSATION, "conversationId"))
                .with_index(StoreIndex::new(MESSAGE_BY_TIMESTAMP, "timestamp")),
        )
        .with_store(
            StoreSchema::new(CALENDAR_EVENTS, "id")
                .auto_generate()
                .with_index(StoreIndex::new(EVENT_BY_REMOTE_ID, "remoteEventId"))
                .with_index(StoreIndex::new(EVENT_BY_CALENDAR, "calendarId"))
                .with_index(StoreIndex::new(EVENT_BY_START, "startTime"))
                .with_index(StoreIndex::new(EVENT_BY_USER, "userId")),
        )
        .with_store(StoreSchema::new(CALENDAR_SYNC_INFO, "userId"))
}
