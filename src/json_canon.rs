// SPDX-License-Identifier: Apache-2.0, MIT

//! Deterministic JSON serialization shared by the block store's JSON
//! convenience layer, the root-record chunker, and the knowledge graph's
//! persisted entity/relationship encoding.
//!
//! `serde_json` alone does not guarantee equal semantic values produce
//! equal bytes: object key order follows insertion order (this crate
//! builds `serde_json` with the `preserve_order` feature, as the rest of
//! the corpus favors index-map-backed JSON for its own canonical forms).
//! This module recursively sorts object keys before serializing, and
//! leaves no insignificant whitespace, so two semantically equal values
//! always hash to the same CID.

use serde::Serialize;
use serde_json::{Map, Value};

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.into_iter().map(|(k, v)| (k, sort_value(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, v);
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Serializes `value` to its canonical byte form: UTF-8 JSON, map keys
/// sorted ascending at every nesting level, no insignificant whitespace.
pub fn to_canonical_vec<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let raw = serde_json::to_value(value)?;
    serde_json::to_vec(&sort_value(raw))
}

/// Parses canonical JSON bytes back into `T`.
pub fn from_slice<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_nested_object_keys() {
        let value = json!({"b": 1, "a": {"z": 1, "y": 2}});
        let bytes = to_canonical_vec(&value).unwrap();
        assert_eq!(bytes, br#"{"a":{"y":2,"z":1},"b":1}"#);
    }

    #[test]
    fn equal_semantic_values_produce_equal_bytes_regardless_of_input_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(to_canonical_vec(&a).unwrap(), to_canonical_vec(&b).unwrap());
    }
}
