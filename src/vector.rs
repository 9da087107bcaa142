// SPDX-License-Identifier: Apache-2.0, MIT

//! Fixed-dimension vector index: flat brute-force scan with a metadata
//! sidecar, CAR-backed persistence, and a predicate filter on search.
//!
//! Grounded on the corpus's simplest flat, map-backed store shapes
//! (`node/db/src/memory.rs`'s `MemoryDB`) rather than an ANN index:
//! approximate nearest-neighbor search isn't called for, and a flat scan
//! is the natural "smallest thing that could work" for the entity-count
//! scale this engine targets.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::cid::Cid;
use crate::codec::Codec;
use crate::config::VectorMetric;
use crate::error::ErrorKind;
use crate::store::{BlockStore, BlockStoreExt, CancellationToken, MemoryBlockStore};

pub type Metadata = serde_json::Map<String, serde_json::Value>;
pub type VectorId = String;

#[derive(Debug, Error)]
pub enum Error {
    #[error("vector has dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("zero-norm vector rejected under the cosine metric")]
    ZeroNormVector,
    #[error("store error: {0}")]
    Store(#[from] crate::store::Error),
    #[error("car error: {0}")]
    Car(#[from] crate::car::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Error::ZeroNormVector => ErrorKind::ZeroNormVector,
            Error::Store(e) => e.kind(),
            Error::Car(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorEntry {
    id: VectorId,
    vector: Vec<f32>,
    metadata: Metadata,
    #[serde(default)]
    deleted: bool,
}

/// One hit from [`VectorIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: VectorId,
    pub similarity: f32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedIndex {
    dim: u32,
    metric: VectorMetric,
    entries: Vec<VectorEntry>,
}

/// Fixed-dimension, fixed-metric vector index. Dimension and metric are
/// immutable once constructed (I7).
pub struct VectorIndex {
    dim: u32,
    metric: VectorMetric,
    entries: RwLock<Vec<VectorEntry>>,
    by_id: RwLock<HashMap<VectorId, usize>>,
}

impl VectorIndex {
    pub fn new(dim: u32, metric: VectorMetric) -> Self {
        Self {
            dim,
            metric,
            entries: RwLock::new(Vec::new()),
            by_id: RwLock::new(HashMap::new()),
        }
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    pub fn metric(&self) -> VectorMetric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.entries.read().iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds vectors with parallel metadata, rejecting the whole batch if
    /// any vector has the wrong dimension or (under `cosine`) zero norm.
    /// Returns the freshly assigned ids in input order.
    pub fn add(&self, vectors: Vec<Vec<f32>>, metadata: Vec<Metadata>) -> Result<Vec<VectorId>, Error> {
        assert_eq!(vectors.len(), metadata.len(), "vectors and metadata must pair up");

        let mut prepared = Vec::with_capacity(vectors.len());
        for vector in vectors {
            if vector.len() != self.dim as usize {
                return Err(Error::DimensionMismatch {
                    expected: self.dim as usize,
                    actual: vector.len(),
                });
            }
            let stored = match self.metric {
                VectorMetric::Cosine => normalize(&vector).ok_or(Error::ZeroNormVector)?,
                VectorMetric::L2 => vector,
            };
            prepared.push(stored);
        }

        let mut ids = Vec::with_capacity(prepared.len());
        let mut entries = self.entries.write();
        let mut by_id = self.by_id.write();
        for (vector, meta) in prepared.into_iter().zip(metadata) {
            let id = Uuid::new_v4().to_string();
            let offset = entries.len();
            entries.push(VectorEntry {
                id: id.clone(),
                vector,
                metadata: meta,
                deleted: false,
            });
            by_id.insert(id.clone(), offset);
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn get_vector(&self, id: &str) -> Option<Vec<f32>> {
        let by_id = self.by_id.read();
        let entries = self.entries.read();
        let offset = *by_id.get(id)?;
        let entry = &entries[offset];
        (!entry.deleted).then(|| entry.vector.clone())
    }

    pub fn get_metadata(&self, id: &str) -> Option<Metadata> {
        let by_id = self.by_id.read();
        let entries = self.entries.read();
        let offset = *by_id.get(id)?;
        let entry = &entries[offset];
        (!entry.deleted).then(|| entry.metadata.clone())
    }

    pub fn update_metadata(&self, id: &str, new_metadata: Metadata) -> bool {
        let by_id = self.by_id.read();
        let Some(&offset) = by_id.get(id) else { return false };
        let mut entries = self.entries.write();
        if entries[offset].deleted {
            return false;
        }
        entries[offset].metadata = new_metadata;
        true
    }

    /// Tombstones `ids`. Subsequent `get_vector`/`get_metadata` return
    /// `None` and `search` skips them. Returns `true` iff every id existed.
    pub fn delete(&self, ids: &[String]) -> bool {
        let by_id = self.by_id.read();
        let mut entries = self.entries.write();
        let mut all_found = true;
        for id in ids {
            match by_id.get(id) {
                Some(&offset) => entries[offset].deleted = true,
                None => all_found = false,
            }
        }
        all_found
    }

    /// Searches for the `top_k` closest non-tombstoned vectors to `query`,
    /// optionally restricted to entries whose metadata passes `filter`.
    /// Cosine similarity is descending; L2 distance is ascending. Ties
    /// break on id, lexicographically ascending.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&dyn Fn(&Metadata) -> bool>,
    ) -> Result<Vec<SearchResult>, Error> {
        if query.len() != self.dim as usize {
            return Err(Error::DimensionMismatch {
                expected: self.dim as usize,
                actual: query.len(),
            });
        }

        let normalized_query;
        let query = match self.metric {
            VectorMetric::Cosine => {
                normalized_query = normalize(query).ok_or(Error::ZeroNormVector)?;
                &normalized_query[..]
            }
            VectorMetric::L2 => query,
        };

        let entries = self.entries.read();
        let mut scored: Vec<(f32, &VectorEntry)> = entries
            .iter()
            .filter(|e| !e.deleted)
            .filter(|e| filter.map(|f| f(&e.metadata)).unwrap_or(true))
            .map(|e| (score(self.metric, query, &e.vector), e))
            .collect();

        match self.metric {
            VectorMetric::Cosine => scored.sort_by(|a, b| {
                b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.1.id.cmp(&b.1.id))
            }),
            VectorMetric::L2 => scored.sort_by(|a, b| {
                a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.1.id.cmp(&b.1.id))
            }),
        }

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, e)| SearchResult {
                id: e.id.clone(),
                similarity: score,
                metadata: e.metadata.clone(),
            })
            .collect())
    }

    /// Serializes the full entry set as a single JSON block in `store` and
    /// returns its CID, for embedding inside a larger block store (e.g. a
    /// knowledge graph's root record) rather than a standalone CAR file.
    pub fn to_block(&self, store: &dyn BlockStore) -> Result<Cid, Error> {
        let persisted = PersistedIndex {
            dim: self.dim,
            metric: self.metric,
            entries: self.entries.read().clone(),
        };
        Ok(store.put_json(&persisted)?)
    }

    /// Inverse of [`VectorIndex::to_block`].
    pub fn from_block(cid: &Cid, store: &dyn BlockStore) -> Result<Self, Error> {
        let persisted: PersistedIndex = store.get_json(cid)?;
        let index = VectorIndex::new(persisted.dim, persisted.metric);
        let mut by_id = HashMap::new();
        for (offset, entry) in persisted.entries.iter().enumerate() {
            by_id.insert(entry.id.clone(), offset);
        }
        *index.entries.write() = persisted.entries;
        *index.by_id.write() = by_id;
        Ok(index)
    }

    /// Serializes the index to a single CAR archive rooted at one block
    /// holding the full entry set.
    pub fn export_to_car(&self, path: impl AsRef<Path>) -> Result<Cid, Error> {
        let store = MemoryBlockStore::new();
        let root_cid = self.to_block(&store)?;

        let codec = Codec::default();
        let mut file = std::fs::File::create(path.as_ref())
            .map_err(crate::store::Error::Io)?;
        crate::car::export_to_writer(&[root_cid], &mut file, &store, &codec, &CancellationToken::new())?;
        Ok(root_cid)
    }

    pub fn from_car(path: impl AsRef<Path>) -> Result<Self, Error> {
        let store = MemoryBlockStore::new();
        let mut file = std::fs::File::open(path.as_ref()).map_err(crate::store::Error::Io)?;
        let roots = crate::car::import_from_reader(&mut file, &store, &CancellationToken::new())?;
        let root = roots.first().ok_or_else(|| {
            crate::store::Error::NotFound("CAR archive carried no root".to_string())
        })?;
        Self::from_block(root, &store)
    }
}

fn normalize(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = (vector.iter().map(|x| x * x).sum::<f32>()).sqrt();
    if norm == 0.0 {
        None
    } else {
        Some(vector.iter().map(|x| x / norm).collect())
    }
}

fn score(metric: VectorMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        VectorMetric::Cosine => a.iter().zip(b).map(|(x, y)| x * y).sum(),
        VectorMetric::L2 => a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(n: i64) -> Metadata {
        let mut m = Metadata::new();
        m.insert("n".to_string(), json!(n));
        m
    }

    #[test]
    fn add_rejects_wrong_dimension() {
        let index = VectorIndex::new(3, VectorMetric::Cosine);
        let err = index.add(vec![vec![1.0, 0.0]], vec![meta(1)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    }

    #[test]
    fn add_rejects_zero_norm_under_cosine() {
        let index = VectorIndex::new(3, VectorMetric::Cosine);
        let err = index.add(vec![vec![0.0, 0.0, 0.0]], vec![meta(1)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ZeroNormVector);
    }

    #[test]
    fn zero_vector_is_allowed_under_l2() {
        let index = VectorIndex::new(3, VectorMetric::L2);
        let ids = index.add(vec![vec![0.0, 0.0, 0.0]], vec![meta(1)]).unwrap();
        assert_eq!(index.get_vector(&ids[0]).unwrap(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn get_vector_returns_normalized_form_under_cosine() {
        let index = VectorIndex::new(2, VectorMetric::Cosine);
        let ids = index.add(vec![vec![3.0, 4.0]], vec![meta(1)]).unwrap();
        let stored = index.get_vector(&ids[0]).unwrap();
        assert!((stored[0] - 0.6).abs() < 1e-6);
        assert!((stored[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn search_orders_cosine_descending() {
        let index = VectorIndex::new(2, VectorMetric::Cosine);
        let ids = index
            .add(vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.9, 0.1]], vec![meta(1), meta(2), meta(3)])
            .unwrap();
        let results = index.search(&[1.0, 0.0], 3, None).unwrap();
        assert_eq!(results[0].id, ids[0]);
        assert!(results[0].similarity >= results[1].similarity);
        assert!(results[1].similarity >= results[2].similarity);
    }

    #[test]
    fn search_orders_l2_ascending() {
        let index = VectorIndex::new(1, VectorMetric::L2);
        let ids = index.add(vec![vec![0.0], vec![5.0], vec![1.0]], vec![meta(1), meta(2), meta(3)]).unwrap();
        let results = index.search(&[0.0], 3, None).unwrap();
        assert_eq!(results[0].id, ids[0]);
        assert_eq!(results[1].id, ids[2]);
        assert_eq!(results[2].id, ids[1]);
    }

    #[test]
    fn delete_tombstones_and_search_skips_it() {
        let index = VectorIndex::new(1, VectorMetric::L2);
        let ids = index.add(vec![vec![1.0], vec![2.0]], vec![meta(1), meta(2)]).unwrap();
        assert!(index.delete(&[ids[0].clone()]));
        assert!(index.get_vector(&ids[0]).is_none());
        let results = index.search(&[1.0], 10, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, ids[1]);
    }

    #[test]
    fn delete_unknown_id_reports_false() {
        let index = VectorIndex::new(1, VectorMetric::L2);
        assert!(!index.delete(&["nonexistent".to_string()]));
    }

    #[test]
    fn filter_predicate_restricts_results() {
        let index = VectorIndex::new(1, VectorMetric::L2);
        index.add(vec![vec![1.0], vec![2.0], vec![3.0]], vec![meta(1), meta(2), meta(3)]).unwrap();
        let filter: &dyn Fn(&Metadata) -> bool =
            &|m: &Metadata| m.get("n").and_then(|v| v.as_i64()) == Some(2);
        let results = index.search(&[0.0], 10, Some(filter)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.get("n").unwrap(), &json!(2));
    }

    #[test]
    fn update_metadata_round_trips() {
        let index = VectorIndex::new(1, VectorMetric::L2);
        let ids = index.add(vec![vec![1.0]], vec![meta(1)]).unwrap();
        assert!(index.update_metadata(&ids[0], meta(42)));
        assert_eq!(index.get_metadata(&ids[0]).unwrap(), meta(42));
    }

    #[test]
    fn export_and_import_round_trip_through_car() {
        let index = VectorIndex::new(2, VectorMetric::Cosine);
        let ids = index.add(vec![vec![1.0, 0.0], vec![0.0, 1.0]], vec![meta(1), meta(2)]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.car");
        index.export_to_car(&path).unwrap();

        let reloaded = VectorIndex::from_car(&path).unwrap();
        assert_eq!(reloaded.dim(), 2);
        assert_eq!(reloaded.get_vector(&ids[0]), index.get_vector(&ids[0]));
        assert_eq!(reloaded.get_metadata(&ids[1]), index.get_metadata(&ids[1]));
    }

    /// Querying with a vector already present in the index must rank that
    /// vector first, regardless of what else shares the index: exact
    /// cosine self-similarity is 1.0, the maximum any other entry can reach.
    #[test]
    fn random_vectors_always_rank_an_exact_match_first() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let dim = rng.gen_range(2..8);
            let count = rng.gen_range(5..20);
            let vectors: Vec<Vec<f32>> = (0..count)
                .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
                .collect();
            let metadatas: Vec<Metadata> = (0..count).map(|i| meta(i as i64)).collect();

            let index = VectorIndex::new(dim, VectorMetric::Cosine);
            let ids = match index.add(vectors.clone(), metadatas) {
                Ok(ids) => ids,
                // A randomly drawn vector can land within floating-point epsilon of zero norm.
                Err(e) if e.kind() == ErrorKind::ZeroNormVector => continue,
                Err(e) => panic!("unexpected error: {e}"),
            };

            let probe = rng.gen_range(0..count);
            let results = index.search(&vectors[probe], count, None).unwrap();
            assert_eq!(results[0].id, ids[probe]);
            assert!((results[0].similarity - 1.0).abs() < 1e-4);
        }
    }
}
