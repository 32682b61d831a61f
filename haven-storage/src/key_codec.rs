//! Order-preserving key encoding.
//!
//! Primary and index keys are stored as lowercase hex of a byte encoding whose
//! bytewise order matches key order, so both DuckDB and SQLite can range-scan
//! and sort them with plain string comparison. Ordering follows the object-store
//! convention: numbers < strings < arrays; arrays compare element-wise.
//! Null, booleans and objects are not valid keys.
//!
//! A number encodes as its nearest `f64` followed by the exact integer offset
//! from that `f64`, so integers beyond 2^53 stay distinct and still sort
//! consistently with floats. Numerically equal values encode identically.

use crate::error::{StorageError, StorageResult};
use crate::key_path;
use crate::schema::StoreIndex;
use serde_json::Value;

const TAG_NUMBER: u8 = 0x10;
const TAG_STRING: u8 = 0x20;
const TAG_ARRAY: u8 = 0x30;
const TERMINATOR: u8 = 0x00;

/// Encodes a key, or `None` if the value is not a valid key.
pub fn encode_key(value: &Value) -> Option<String> {
    let mut out = Vec::new();
    encode_into(value, &mut out)?;
    Some(hex::encode(out))
}

/// Encodes a primary key, rejecting invalid ones.
pub fn encode_primary_key(value: &Value) -> StorageResult<String> {
    encode_key(value).ok_or_else(|| {
        StorageError::InvalidOperation(format!("{value} is not a valid key"))
    })
}

fn encode_into(value: &Value, out: &mut Vec<u8>) -> Option<()> {
    match value {
        Value::Number(n) => {
            let (f, offset) = match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => integer_parts(i128::from(i)),
                (None, Some(u)) => integer_parts(i128::from(u)),
                _ => (n.as_f64()?, 0),
            };
            if f.is_nan() {
                return None;
            }
            out.push(TAG_NUMBER);
            out.extend_from_slice(&ordered_f64_bits(f).to_be_bytes());
            out.extend_from_slice(&ordered_i64_bits(offset).to_be_bytes());
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            for &b in s.as_bytes() {
                out.push(b);
                // Escape embedded NULs so the terminator stays unambiguous.
                if b == 0x00 {
                    out.push(0xFF);
                }
            }
            out.push(TERMINATOR);
            out.push(TERMINATOR);
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                encode_into(item, out)?;
            }
            out.push(TERMINATOR);
        }
        Value::Null | Value::Bool(_) | Value::Object(_) => return None,
    }
    Some(())
}

/// Nearest `f64` of an integer and the exact remainder. The remainder is
/// bounded by half the `f64` spacing at 2^64, far inside `i64`.
fn integer_parts(i: i128) -> (f64, i64) {
    let f = i as f64;
    let offset = i - f as i128;
    (f, offset as i64)
}

/// Maps i64 onto u64 so that unsigned comparison matches signed order.
fn ordered_i64_bits(i: i64) -> u64 {
    (i as u64) ^ (1 << 63)
}

/// Maps f64 onto u64 so that unsigned comparison matches numeric order.
fn ordered_f64_bits(f: f64) -> u64 {
    // Normalize -0.0 so it equals 0.0.
    let f = if f == 0.0 { 0.0 } else { f };
    let bits = f.to_bits();
    if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) }
}

/// Index keys a record contributes to `index`, deduplicated and in order.
///
/// Records lacking the key path (or holding an invalid key) contribute none.
/// Multi-entry indexes contribute one key per valid array element.
pub fn index_keys(record: &Value, index: &StoreIndex) -> Vec<String> {
    let Some(value) = key_path::extract(record, &index.key_path) else {
        return Vec::new();
    };
    let mut keys: Vec<String> = match (&value, index.multi_entry) {
        (Value::Array(items), true) => items.iter().filter_map(encode_key).collect(),
        _ => encode_key(&value).into_iter().collect(),
    };
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn enc(v: Value) -> String {
        encode_key(&v).unwrap()
    }

    #[test]
    fn numbers_sort_numerically() {
        assert!(enc(json!(-10.5)) < enc(json!(-1)));
        assert!(enc(json!(-1)) < enc(json!(0)));
        assert!(enc(json!(0)) < enc(json!(2)));
        assert!(enc(json!(2)) < enc(json!(10)));
        assert_eq!(enc(json!(0.0)), enc(json!(-0.0)));
    }

    #[test]
    fn large_integers_stay_distinct_and_ordered() {
        let two_53 = 9_007_199_254_740_992_i64;
        assert_ne!(enc(json!(two_53)), enc(json!(two_53 + 1)));
        assert!(enc(json!(two_53)) < enc(json!(two_53 + 1)));
        assert!(enc(json!(two_53 + 1)) < enc(json!(two_53 + 2)));
        assert!(enc(json!(i64::MAX)) < enc(json!(u64::MAX)));
        assert!(enc(json!(u64::MAX - 1)) < enc(json!(u64::MAX)));
        assert!(enc(json!(i64::MIN)) < enc(json!(i64::MIN + 1)));
    }

    #[test]
    fn equal_integers_and_floats_share_an_encoding() {
        assert_eq!(enc(json!(3)), enc(json!(3.0)));
        assert_eq!(enc(json!(9_007_199_254_740_992_i64)), enc(json!(9_007_199_254_740_992.0)));
        assert!(enc(json!(2.5)) < enc(json!(3)));
        assert!(enc(json!(9_007_199_254_740_993_i64)) < enc(json!(9_007_199_254_740_996.0)));
    }

    #[test]
    fn strings_sort_lexicographically() {
        assert!(enc(json!("a")) < enc(json!("ab")));
        assert!(enc(json!("ab")) < enc(json!("b")));
        assert!(enc(json!("")) < enc(json!("a")));
        assert!(enc(json!("a")) < enc(json!("a\u{0}")));
    }

    #[test]
    fn types_sort_numbers_strings_arrays() {
        assert!(enc(json!(1_000_000)) < enc(json!("0")));
        assert!(enc(json!("zzz")) < enc(json!([])));
    }

    #[test]
    fn arrays_compare_element_wise() {
        assert!(enc(json!([1, "a"])) < enc(json!([1, "b"])));
        assert!(enc(json!([1])) < enc(json!([1, "a"])));
        assert!(enc(json!([1, "z"])) < enc(json!([2])));
    }

    #[test]
    fn invalid_keys_are_rejected() {
        assert!(encode_key(&json!(null)).is_none());
        assert!(encode_key(&json!(true)).is_none());
        assert!(encode_key(&json!({"a": 1})).is_none());
        assert!(encode_key(&json!([1, null])).is_none());
        assert!(encode_primary_key(&json!(false)).is_err());
    }

    #[test]
    fn multi_entry_index_yields_each_element() {
        let index = StoreIndex::new("by_tag", "tags").multi_entry();
        let keys = index_keys(&json!({"tags": ["b", "a", "b", null]}), &index);
        assert_eq!(keys, vec![enc(json!("a")), enc(json!("b"))]);
    }

    #[test]
    fn plain_index_on_array_uses_whole_array() {
        let index = StoreIndex::new("by_tag", "tags");
        let keys = index_keys(&json!({"tags": ["b", "a"]}), &index);
        assert_eq!(keys, vec![enc(json!(["b", "a"]))]);
    }

    #[test]
    fn missing_field_yields_no_keys() {
        let index = StoreIndex::new("by_email", "email");
        assert!(index_keys(&json!({"name": "x"}), &index).is_empty());
    }

    proptest! {
        #[test]
        fn number_encoding_preserves_order(a in -1.0e12f64..1.0e12, b in -1.0e12f64..1.0e12) {
            let ea = enc(json!(a));
            let eb = enc(json!(b));
            prop_assert_eq!(a.partial_cmp(&b).unwrap(), ea.cmp(&eb));
        }

        #[test]
        fn integer_encoding_preserves_order(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(a.cmp(&b), enc(json!(a)).cmp(&enc(json!(b))));
        }

        #[test]
        fn unsigned_encoding_preserves_order(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(a.cmp(&b), enc(json!(a)).cmp(&enc(json!(b))));
        }

        #[test]
        fn string_encoding_preserves_order(a in ".*", b in ".*") {
            let ea = enc(json!(a.clone()));
            let eb = enc(json!(b.clone()));
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ea.cmp(&eb));
        }
    }
}
