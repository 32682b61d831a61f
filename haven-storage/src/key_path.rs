//! Dotted key-path access into JSON records.

use crate::error::{StorageError, StorageResult};
use crate::schema::KeyPath;
use serde_json::Value;

/// Reads the value at a dotted path (`"meta.owner"`).
pub fn get<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.as_object()?.get(segment))
}

/// Writes `value` at a dotted path, creating intermediate objects.
pub fn set(record: &mut Value, path: &str, value: Value) -> StorageResult<()> {
    let mut segments = path.split('.').peekable();
    let mut current = record;
    while let Some(segment) = segments.next() {
        let obj = current.as_object_mut().ok_or_else(|| {
            StorageError::InvalidOperation(format!("cannot set '{path}': not an object"))
        })?;
        if segments.peek().is_none() {
            obj.insert(segment.to_string(), value);
            return Ok(());
        }
        current = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    Ok(())
}

/// Extracts the key described by `key_path`. Compound paths yield an array and
/// require every component to be present.
pub fn extract(record: &Value, key_path: &KeyPath) -> Option<Value> {
    match key_path {
        KeyPath::Single(path) => get(record, path).filter(|v| !v.is_null()).cloned(),
        KeyPath::Compound(paths) => paths
            .iter()
            .map(|p| get(record, p).filter(|v| !v.is_null()).cloned())
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
    }
}
