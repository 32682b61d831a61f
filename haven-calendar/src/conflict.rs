//! Conflict resolution between a local and a remote copy of one event.
//!
//! The copy with the later `lastModified` is the base; on an exact tie the
//! remote copy wins. Fields absent or null on the base are filled from the
//! other copy. The local id always survives.

use crate::error::SyncResult;
use crate::types::CalendarEvent;
use serde_json::Value;

/// Which copy a merge started from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeBase {
    Local,
    Remote,
}

pub fn merge_base(local: &CalendarEvent, remote: &CalendarEvent) -> MergeBase {
    if local.last_modified > remote.last_modified {
        MergeBase::Local
    } else {
        MergeBase::Remote
    }
}

/// Merges `remote` into `local`.
pub fn resolve(local: &CalendarEvent, remote: &CalendarEvent) -> SyncResult<CalendarEvent> {
    let (base, other) = match merge_base(local, remote) {
        MergeBase::Local => (local, remote),
        MergeBase::Remote => (remote, local),
    };
    let mut merged = serde_json::to_value(base)?;
    let other = serde_json::to_value(other)?;
    if let (Value::Object(merged_fields), Value::Object(other_fields)) = (&mut merged, other) {
        for (field, value) in other_fields {
            let missing = merged_fields.get(&field).is_none_or(Value::is_null);
            if missing && !value.is_null() {
                merged_fields.insert(field, value);
            }
        }
    }
    let mut merged: CalendarEvent = serde_json::from_value(merged)?;
    merged.id = local.id.clone();
    Ok(merged)
}
