// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};

/// Hard upper bound on any single stored block, per the IPFS block-size
/// convention (1 MiB). No block the engine writes may exceed this.
pub const MAX_BLOCK_SIZE: usize = 1_048_576;

/// Default trigger size for root-record externalization (~800 KiB), leaving
/// headroom under [`MAX_BLOCK_SIZE`] for the chunk descriptors themselves.
pub const DEFAULT_ROOT_CHUNK_THRESHOLD: usize = 819_200;

/// Default shard cap used when a single externalized field still doesn't
/// fit in one block and must be split across a manifest.
pub const DEFAULT_MAX_SHARD_SIZE: usize = 819_200;

/// Engine-wide configuration, covering every recognized key.
///
/// Mirrors the flat, doc-commented, `#[serde(default)]` configuration
/// struct shape used for backend-specific configuration elsewhere in the
/// corpus: every field has a sensible default, and the struct round-trips
/// through JSON/YAML/TOML without any field being mandatory.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Hard upper bound per stored block.
    pub max_block_size: usize,
    /// Trigger size for root-record externalization.
    pub root_chunk_threshold: usize,
    /// Maximum size of a single shard when a field must be split further.
    pub max_shard_size: usize,
    /// Number of entries kept in the DAG-PB encode/decode LRU cache.
    pub codec_cache_size: usize,
    /// Name of the hash function backing CID computation. Only `"sha2-256"`
    /// is currently implemented; the field exists so callers can assert on
    /// it and so a future hash function can be added without breaking the
    /// config schema.
    pub cid_hash: String,
    /// CAR format version. Only `1` is supported.
    pub car_version: u64,
    /// Similarity metric used by new vector indices.
    pub vector_metric: VectorMetric,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorMetric {
    Cosine,
    L2,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_block_size: MAX_BLOCK_SIZE,
            root_chunk_threshold: DEFAULT_ROOT_CHUNK_THRESHOLD,
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            codec_cache_size: 1024,
            cid_hash: "sha2-256".to_string(),
            car_version: 1,
            vector_metric: VectorMetric::Cosine,
        }
    }
}
