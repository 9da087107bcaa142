// SPDX-License-Identifier: Apache-2.0, MIT

//! Large-root chunker: keeps a knowledge graph's root record under the
//! configured threshold by externalizing oversize collection fields to
//! child blocks, referenced via a chunk descriptor.
//!
//! There is no direct analogue for this in the reference engine (Forest's
//! own root records — genesis/tipset state roots — are bounded by
//! protocol consensus rules rather than an application-level externalize
//! step), so this module's *shape* (JSON value manipulation, sorted-key
//! canonical encoding) is grounded on `ipld/src/json.rs` and this crate's
//! own [`crate::json_canon`], while the externalization algorithm is this
//! module's own design.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cid::{cid_to_string, Cid};
use crate::config::Config;
use crate::error::ErrorKind;
use crate::json_canon;
use crate::store::{parse_cid, BlockStore};

#[derive(Debug, Error)]
pub enum Error {
    #[error("root record exceeds root_chunk_threshold even after externalizing every field")]
    RootTooLarge,
    #[error("corrupt chunked root: {0}")]
    CorruptRoot(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] crate::store::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RootTooLarge => ErrorKind::RootTooLarge,
            Error::CorruptRoot(_) => ErrorKind::CorruptBlock,
            Error::Json(_) => ErrorKind::CorruptBlock,
            Error::Store(e) => e.kind(),
        }
    }
}

/// The knowledge graph's root record, fully resolved in memory (chunk
/// descriptors, if any were used on disk, have already been followed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RootRecord {
    pub name: String,
    pub entity_ids: Vec<String>,
    pub entity_cids: BTreeMap<String, String>,
    pub relationship_ids: Vec<String>,
    pub relationship_cids: BTreeMap<String, String>,
    pub vector_store_cid: Option<String>,
}

/// Fields considered for externalization, in fixed priority order.
const EXTERNALIZABLE_FIELDS: [&str; 4] =
    ["entity_ids", "entity_cids", "relationship_ids", "relationship_cids"];

fn inline_value(record: &RootRecord) -> Value {
    serde_json::json!({
        "name": record.name,
        "entity_ids": record.entity_ids,
        "entity_cids": record.entity_cids,
        "relationship_ids": record.relationship_ids,
        "relationship_cids": record.relationship_cids,
        "vector_store_cid": record.vector_store_cid,
    })
}

fn chunk_descriptor(cid: &Cid) -> Value {
    serde_json::json!({ "_chunked": true, "_cid": cid_to_string(cid) })
}

fn is_chunk_descriptor(value: &Value) -> bool {
    matches!(value.get("_chunked"), Some(Value::Bool(true)))
}

fn is_manifest(value: &Value) -> bool {
    matches!(value.get("_manifest"), Some(Value::Bool(true)))
}

/// Splits an array's items into contiguous shards, each serializing to at
/// most `cap` bytes. A single item whose own serialized size exceeds `cap`
/// still gets its own (oversize) shard — values are never split mid-item.
fn shard_array(items: &[Value], cap: usize) -> Result<Vec<Value>, Error> {
    let mut shards = Vec::new();
    let mut current = Vec::new();
    let mut current_len = 2; // "[]"
    for item in items {
        let item_len = json_canon::to_canonical_vec(item)?.len();
        if !current.is_empty() && current_len + item_len + 1 > cap {
            shards.push(Value::Array(std::mem::take(&mut current)));
            current_len = 2;
        }
        current_len += item_len + 1;
        current.push(item.clone());
    }
    if !current.is_empty() || shards.is_empty() {
        shards.push(Value::Array(current));
    }
    Ok(shards)
}

/// Same contiguous-accumulation strategy as [`shard_array`], over a sorted
/// object's entries so shard boundaries (and thus re-concatenation) are
/// deterministic.
fn shard_object(entries: &Map<String, Value>, cap: usize) -> Result<Vec<Value>, Error> {
    let mut shards = Vec::new();
    let mut current = Map::new();
    let mut current_len = 2; // "{}"
    for (key, value) in entries {
        let entry_len = json_canon::to_canonical_vec(&serde_json::json!({ key: value }))?.len();
        if !current.is_empty() && current_len + entry_len > cap {
            shards.push(Value::Object(std::mem::take(&mut current)));
            current_len = 2;
        }
        current_len += entry_len;
        current.insert(key.clone(), value.clone());
    }
    if !current.is_empty() || shards.is_empty() {
        shards.push(Value::Object(current));
    }
    Ok(shards)
}

fn shard_and_store(value: &Value, store: &dyn BlockStore, cap: usize) -> Result<Cid, Error> {
    let shards = match value {
        Value::Array(items) => shard_array(items, cap)?,
        Value::Object(entries) => shard_object(entries, cap)?,
        other => return Err(Error::CorruptRoot(format!("field is not a collection: {other}"))),
    };

    let shard_cids: Vec<String> = shards
        .iter()
        .map(|shard| -> Result<String, Error> {
            let bytes = json_canon::to_canonical_vec(shard)?;
            Ok(cid_to_string(&store.put(&bytes)?))
        })
        .collect::<Result<_, _>>()?;

    let manifest = serde_json::json!({ "_manifest": true, "shards": shard_cids });
    let manifest_bytes = json_canon::to_canonical_vec(&manifest)?;
    Ok(store.put(&manifest_bytes)?)
}

/// Builds the root record bytes, externalizing fields as needed to stay
/// within `config.root_chunk_threshold`, and persists the result. Returns
/// the root block's CID and its bytes.
pub fn serialize_root(
    record: &RootRecord,
    store: &dyn BlockStore,
    config: &Config,
) -> Result<(Cid, Vec<u8>), Error> {
    let mut value = inline_value(record);
    let mut bytes = json_canon::to_canonical_vec(&value)?;

    if bytes.len() <= config.root_chunk_threshold {
        let cid = store.put(&bytes)?;
        return Ok((cid, bytes));
    }

    for field in EXTERNALIZABLE_FIELDS {
        let field_value = value
            .get(field)
            .cloned()
            .expect("inline_value always populates every externalizable field");
        let field_bytes = json_canon::to_canonical_vec(&field_value)?;

        let descriptor = if field_bytes.len() <= config.max_block_size {
            let child_cid = store.put(&field_bytes)?;
            chunk_descriptor(&child_cid)
        } else {
            let manifest_cid = shard_and_store(&field_value, store, config.max_shard_size)?;
            chunk_descriptor(&manifest_cid)
        };

        value[field] = descriptor;
        bytes = json_canon::to_canonical_vec(&value)?;
        debug!(target: "weave::chunker", field, size = bytes.len(), "externalized root field");

        if bytes.len() <= config.root_chunk_threshold {
            let cid = store.put(&bytes)?;
            return Ok((cid, bytes));
        }
    }

    warn!(target: "weave::chunker", size = bytes.len(), threshold = config.root_chunk_threshold, "root too large after externalizing every field");
    Err(Error::RootTooLarge)
}

fn merge_shards(store: &dyn BlockStore, shard_cid_values: &[Value]) -> Result<Value, Error> {
    let mut merged_items = Vec::new();
    let mut merged_map = Map::new();
    let mut saw_array = false;
    let mut saw_object = false;

    for shard_cid_value in shard_cid_values {
        let shard_cid_str = shard_cid_value
            .as_str()
            .ok_or_else(|| Error::CorruptRoot("manifest shard entry is not a string".to_string()))?;
        let shard_cid = parse_cid(shard_cid_str)?;
        let shard_bytes = store.get(&shard_cid)?;
        let shard_value: Value = json_canon::from_slice(&shard_bytes)?;
        match shard_value {
            Value::Array(items) => {
                saw_array = true;
                merged_items.extend(items);
            }
            Value::Object(entries) => {
                saw_object = true;
                merged_map.extend(entries);
            }
            other => return Err(Error::CorruptRoot(format!("unexpected shard shape: {other}"))),
        }
    }

    if saw_array && saw_object {
        return Err(Error::CorruptRoot("manifest mixes array and object shards".to_string()));
    }
    Ok(if saw_object {
        Value::Object(merged_map)
    } else {
        Value::Array(merged_items)
    })
}

fn resolve_field(raw: Value, store: &dyn BlockStore) -> Result<Value, Error> {
    if !is_chunk_descriptor(&raw) {
        return Ok(raw);
    }
    let cid_str = raw
        .get("_cid")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::CorruptRoot("chunk descriptor missing _cid".to_string()))?;
    let cid = parse_cid(cid_str)?;
    let bytes = store.get(&cid)?;
    let fetched: Value = json_canon::from_slice(&bytes)?;

    if is_manifest(&fetched) {
        let shards = fetched
            .get("shards")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::CorruptRoot("manifest missing shards array".to_string()))?;
        merge_shards(store, shards)
    } else {
        Ok(fetched)
    }
}

/// Collects every CID a serialized root record references via chunk
/// descriptors (including shard manifests' member CIDs), without merging
/// their contents back in. CAR export uses this to ship externalized
/// fields alongside the root block — the CAR streamer only walks DAG-PB
/// link closures, and a chunked root is a `raw` block whose descriptors
/// are plain JSON, not PBLinks.
pub fn collect_chunk_cids(bytes: &[u8], store: &dyn BlockStore) -> Result<Vec<Cid>, Error> {
    let value: Value = json_canon::from_slice(bytes)?;
    let obj = value
        .as_object()
        .ok_or_else(|| Error::CorruptRoot("root record is not a JSON object".to_string()))?;

    let mut cids = Vec::new();
    for field in EXTERNALIZABLE_FIELDS {
        let Some(raw) = obj.get(field) else { continue };
        if !is_chunk_descriptor(raw) {
            continue;
        }
        let cid_str = raw
            .get("_cid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::CorruptRoot("chunk descriptor missing _cid".to_string()))?;
        let cid = parse_cid(cid_str)?;
        let fetched_bytes = store.get(&cid)?;
        cids.push(cid);

        let fetched: Value = json_canon::from_slice(&fetched_bytes)?;
        if is_manifest(&fetched) {
            let shards = fetched
                .get("shards")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::CorruptRoot("manifest missing shards array".to_string()))?;
            for shard_cid_value in shards {
                let shard_cid_str = shard_cid_value
                    .as_str()
                    .ok_or_else(|| Error::CorruptRoot("manifest shard entry is not a string".to_string()))?;
                cids.push(parse_cid(shard_cid_str)?);
            }
        }
    }
    Ok(cids)
}

/// Loads a root record from its serialized bytes, resolving any chunk
/// descriptors (including multi-shard manifests) back to inline values.
/// A field that was never externalized is used directly, so records
/// written before chunking kicked in remain loadable unchanged.
pub fn deserialize_root(bytes: &[u8], store: &dyn BlockStore) -> Result<RootRecord, Error> {
    let value: Value = json_canon::from_slice(bytes)?;
    let obj = value
        .as_object()
        .ok_or_else(|| Error::CorruptRoot("root record is not a JSON object".to_string()))?;

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let entity_ids_v = resolve_field(obj.get("entity_ids").cloned().unwrap_or(Value::Array(vec![])), store)?;
    let entity_cids_v = resolve_field(obj.get("entity_cids").cloned().unwrap_or(Value::Object(Map::new())), store)?;
    let relationship_ids_v = resolve_field(
        obj.get("relationship_ids").cloned().unwrap_or(Value::Array(vec![])),
        store,
    )?;
    let relationship_cids_v = resolve_field(
        obj.get("relationship_cids").cloned().unwrap_or(Value::Object(Map::new())),
        store,
    )?;

    let vector_store_cid = obj
        .get("vector_store_cid")
        .and_then(Value::as_str)
        .map(String::from);

    Ok(RootRecord {
        name,
        entity_ids: serde_json::from_value(entity_ids_v)?,
        entity_cids: serde_json::from_value(entity_cids_v)?,
        relationship_ids: serde_json::from_value(relationship_ids_v)?,
        relationship_cids: serde_json::from_value(relationship_cids_v)?,
        vector_store_cid,
    })
}
