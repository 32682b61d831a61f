//! Query descriptions: index, key range, direction, paging and filter.

use crate::error::{StorageError, StorageResult};
use crate::key_codec;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Iteration order over the index (or primary key).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Next,
    Prev,
}

/// Bounds on an index key. Either side may be absent; each bound is closed
/// unless flagged open.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyRange {
    pub lower: Option<Value>,
    pub upper: Option<Value>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// Exactly one key.
    pub fn only(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            lower: Some(value.clone()),
            upper: Some(value),
            ..Self::default()
        }
    }

    pub fn bound(lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
            ..Self::default()
        }
    }

    pub fn lower_bound(lower: impl Into<Value>) -> Self {
        Self {
            lower: Some(lower.into()),
            ..Self::default()
        }
    }

    pub fn upper_bound(upper: impl Into<Value>) -> Self {
        Self {
            upper: Some(upper.into()),
            ..Self::default()
        }
    }

    pub fn open_lower(mut self) -> Self {
        self.lower_open = true;
        self
    }

    pub fn open_upper(mut self) -> Self {
        self.upper_open = true;
        self
    }

    /// Encodes both bounds, rejecting invalid keys and inverted ranges.
    pub fn encode(&self) -> StorageResult<EncodedRange> {
        let lower = self.lower.as_ref().map(encode_bound).transpose()?;
        let upper = self.upper.as_ref().map(encode_bound).transpose()?;
        if let (Some(lo), Some(hi)) = (&lower, &upper) {
            if lo > hi {
                return Err(StorageError::InvalidOperation(format!(
                    "key range lower bound {} is greater than upper bound {}",
                    self.lower.as_ref().unwrap_or(&Value::Null),
                    self.upper.as_ref().unwrap_or(&Value::Null),
                )));
            }
        }
        Ok(EncodedRange {
            lower,
            upper,
            lower_open: self.lower_open,
            upper_open: self.upper_open,
        })
    }

    pub fn validate(&self) -> StorageResult<()> {
        self.encode().map(|_| ())
    }
}

fn encode_bound(value: &Value) -> StorageResult<String> {
    key_codec::encode_key(value).ok_or_else(|| {
        StorageError::InvalidOperation(format!("{value} is not a valid key range bound"))
    })
}

/// A [`KeyRange`] in encoded key space, comparable with plain string order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedRange {
    pub lower: Option<String>,
    pub upper: Option<String>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl EncodedRange {
    pub fn contains(&self, key: &str) -> bool {
        let above = match &self.lower {
            Some(lo) if self.lower_open => key > lo.as_str(),
            Some(lo) => key >= lo.as_str(),
            None => true,
        };
        let below = match &self.upper {
            Some(hi) if self.upper_open => key < hi.as_str(),
            Some(hi) => key <= hi.as_str(),
            None => true,
        };
        above && below
    }
}

/// In-memory predicate applied to decrypted records.
pub type RecordFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A query against one store.
///
/// Evaluation order is fixed: index/range selection (backend-native), then the
/// filter, then offset, then limit.
#[derive(Clone, Default)]
pub struct StorageQuery {
    pub store: String,
    /// Index to scan; `None` scans by primary key.
    pub index: Option<String>,
    pub range: Option<KeyRange>,
    pub direction: Direction,
    pub limit: Option<usize>,
    pub offset: usize,
    pub filter: Option<RecordFilter>,
}

impl StorageQuery {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            ..Self::default()
        }
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn reverse(mut self) -> Self {
        self.direction = Direction::Prev;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Encoded range, or the unbounded range when none was given.
    pub fn encoded_range(&self) -> StorageResult<EncodedRange> {
        match &self.range {
            Some(range) => range.encode(),
            None => Ok(EncodedRange::default()),
        }
    }
}

impl fmt::Debug for StorageQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageQuery")
            .field("store", &self.store)
            .field("index", &self.index)
            .field("range", &self.range)
            .field("direction", &self.direction)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Accumulates cursor output, applying filter, offset and limit in order.
pub(crate) struct Collector {
    filter: Option<RecordFilter>,
    to_skip: usize,
    limit: Option<usize>,
    items: Vec<Value>,
}

impl Collector {
    pub(crate) fn new(query: &StorageQuery) -> Self {
        Self {
            filter: query.filter.clone(),
            to_skip: query.offset,
            limit: query.limit,
            items: Vec::new(),
        }
    }

    /// Offers one record; returns `false` once the limit is reached and the
    /// cursor should stop.
    pub(crate) fn push(&mut self, record: Value) -> bool {
        if self.is_full() {
            return false;
        }
        if let Some(filter) = &self.filter {
            if !filter(&record) {
                return true;
            }
        }
        if self.to_skip > 0 {
            self.to_skip -= 1;
            return true;
        }
        self.items.push(record);
        !self.is_full()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.items.len() >= limit)
    }

    pub(crate) fn finish(self) -> Vec<Value> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inverted_range_is_invalid() {
        let err = KeyRange::bound(10, 1).validate().unwrap_err();
        assert!(matches!(err, StorageError::InvalidOperation(_)));
        assert!(KeyRange::bound(1, 1).validate().is_ok());
    }

    #[test]
    fn null_bound_is_invalid() {
        assert!(KeyRange::lower_bound(Value::Null).validate().is_err());
    }

    #[test]
    fn encoded_range_respects_open_flags() {
        let closed = KeyRange::bound(1, 3).encode().unwrap();
        let open = KeyRange::bound(1, 3).open_lower().open_upper().encode().unwrap();
        let key = |v: i64| key_codec::encode_key(&json!(v)).unwrap();

        assert!(closed.contains(&key(1)));
        assert!(closed.contains(&key(3)));
        assert!(!closed.contains(&key(4)));
        assert!(!open.contains(&key(1)));
        assert!(open.contains(&key(2)));
        assert!(!open.contains(&key(3)));
    }

    #[test]
    fn collector_filters_then_skips_then_limits() {
        let query = StorageQuery::new("s")
            .filter(|v| v["n"].as_i64().is_some_and(|n| n % 2 == 0))
            .offset(1)
            .limit(2);
        let mut collector = Collector::new(&query);
        let mut offered = 0;
        for n in 0..20 {
            offered += 1;
            if !collector.push(json!({ "n": n })) {
                break;
            }
        }
        let ns: Vec<i64> = collector.finish().iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 4]);
        assert_eq!(offered, 5);
    }
}
