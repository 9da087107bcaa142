// SPDX-License-Identifier: Apache-2.0, MIT

//! Knowledge graph: entities and typed relationships layered on the block
//! store, with secondary indices, vector-augmented lookup, and budgeted
//! traversal.
//!
//! In-memory state mirrors `node/db`'s `RwLock`-guarded shared-state
//! pattern (one writer, many readers); graph mutations are cheap and
//! buffered in memory until [`KnowledgeGraph::update_root_cid`] flushes
//! dirty entities/relationships through the codec and chunker.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::chunker::{self, RootRecord};
use crate::cid::{cid_to_string, Cid};
use crate::codec::Codec;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::store::{parse_cid, BlockStore, BlockStoreExt, CancellationToken, MemoryBlockStore};
use crate::vector::{Metadata, VectorIndex};

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("no vector store is attached to this graph")]
    VectorStoreNotAttached,
    #[error("store error: {0}")]
    Store(#[from] crate::store::Error),
    #[error("chunker error: {0}")]
    Chunker(#[from] chunker::Error),
    #[error("vector index error: {0}")]
    Vector(#[from] crate::vector::Error),
    #[error("car error: {0}")]
    Car(#[from] crate::car::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownEntity(_) => ErrorKind::UnknownEntity,
            Error::VectorStoreNotAttached => ErrorKind::Other,
            Error::Store(e) => e.kind(),
            Error::Chunker(e) => e.kind(),
            Error::Vector(e) => e.kind(),
            Error::Car(e) => e.kind(),
        }
    }
}

/// Graph primitive identified by a UUID `id`. `type` indexes the entity
/// into [`KnowledgeGraph`]'s secondary `entity_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    pub properties: Metadata,
    pub vector_ids: Option<Vec<String>>,
}

/// Directed, typed edge between two entities. Multiple relationships
/// between the same pair are allowed as long as their ids differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub source_id: String,
    pub target_id: String,
    pub properties: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub entity: Entity,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorQueryResult {
    pub entity: Entity,
    pub similarity: f32,
    pub hops: usize,
}

#[derive(Default)]
struct GraphState {
    entities: HashMap<String, Entity>,
    entity_cids: HashMap<String, Cid>,
    entity_index: HashMap<String, HashSet<String>>,
    relationships: HashMap<String, Relationship>,
    relationship_cids: HashMap<String, Cid>,
    relationship_index: HashMap<String, HashSet<String>>,
    outgoing: HashMap<String, HashSet<String>>,
    incoming: HashMap<String, HashSet<String>>,
    dirty_entities: HashSet<String>,
    dirty_relationships: HashSet<String>,
    root_cid: Option<Cid>,
}

fn neighbors(state: &GraphState, entity_id: &str, relationship_types: Option<&[String]>) -> Vec<String> {
    let mut out = Vec::new();
    for rel_id in state.outgoing.get(entity_id).into_iter().flatten() {
        let rel = &state.relationships[rel_id];
        if relationship_types.map(|types| types.iter().any(|t| t == &rel.relationship_type)).unwrap_or(true) {
            out.push(rel.target_id.clone());
        }
    }
    for rel_id in state.incoming.get(entity_id).into_iter().flatten() {
        let rel = &state.relationships[rel_id];
        if relationship_types.map(|types| types.iter().any(|t| t == &rel.relationship_type)).unwrap_or(true) {
            out.push(rel.source_id.clone());
        }
    }
    out
}

/// Entity/relationship model over a content-addressed block store, with
/// transparent root chunking (see [`crate::chunker`]) so arbitrarily large
/// graphs still have a single, stably small root CID.
pub struct KnowledgeGraph {
    name: String,
    store: Arc<dyn BlockStore>,
    config: Config,
    vector_store: Option<Arc<VectorIndex>>,
    state: parking_lot::RwLock<GraphState>,
}

impl KnowledgeGraph {
    pub fn new(name: impl Into<String>, store: Arc<dyn BlockStore>, config: Config) -> Self {
        Self {
            name: name.into(),
            store,
            config,
            vector_store: None,
            state: parking_lot::RwLock::new(GraphState::default()),
        }
    }

    pub fn attach_vector_store(&mut self, vector_store: Arc<VectorIndex>) {
        self.vector_store = Some(vector_store);
    }

    pub fn root_cid(&self) -> Option<Cid> {
        self.state.read().root_cid
    }

    pub fn entity_count(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.state.read().relationships.len()
    }

    /// Assigns a fresh id, indexes the entity by `type`, and (if a vector
    /// store is attached and `vector` is supplied) records the resulting
    /// vector id under `properties.vector_ids`.
    pub fn add_entity(
        &self,
        entity_type: impl Into<String>,
        name: impl Into<String>,
        mut properties: Metadata,
        vector: Option<Vec<f32>>,
    ) -> Result<Entity, Error> {
        let entity_type = entity_type.into();
        let id = Uuid::new_v4().to_string();

        let vector_ids = match vector {
            Some(v) => {
                let vs = self.vector_store.as_ref().ok_or(Error::VectorStoreNotAttached)?;
                let ids = vs.add(vec![v], vec![properties.clone()])?;
                properties.insert("vector_ids".to_string(), serde_json::json!(ids));
                Some(ids)
            }
            None => None,
        };

        let entity = Entity {
            id: id.clone(),
            entity_type: entity_type.clone(),
            name: name.into(),
            properties,
            vector_ids,
        };

        let mut state = self.state.write();
        state.entity_index.entry(entity_type).or_default().insert(id.clone());
        state.entities.insert(id.clone(), entity.clone());
        state.dirty_entities.insert(id);
        debug!(target: "weave::graph", entity_id = %entity.id, "added entity");
        Ok(entity)
    }

    /// Validates both endpoints exist (I5) before recording the edge.
    pub fn add_relationship(
        &self,
        relationship_type: impl Into<String>,
        source_id: &str,
        target_id: &str,
        properties: Metadata,
    ) -> Result<Relationship, Error> {
        {
            let state = self.state.read();
            if !state.entities.contains_key(source_id) {
                return Err(Error::UnknownEntity(source_id.to_string()));
            }
            if !state.entities.contains_key(target_id) {
                return Err(Error::UnknownEntity(target_id.to_string()));
            }
        }

        let relationship_type = relationship_type.into();
        let id = Uuid::new_v4().to_string();
        let relationship = Relationship {
            id: id.clone(),
            relationship_type: relationship_type.clone(),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            properties,
        };

        let mut state = self.state.write();
        state.relationship_index.entry(relationship_type).or_default().insert(id.clone());
        state.outgoing.entry(source_id.to_string()).or_default().insert(id.clone());
        state.incoming.entry(target_id.to_string()).or_default().insert(id.clone());
        state.relationships.insert(id.clone(), relationship.clone());
        state.dirty_relationships.insert(id);
        Ok(relationship)
    }

    pub fn get_entity(&self, id: &str) -> Option<Entity> {
        self.state.read().entities.get(id).cloned()
    }

    pub fn get_relationship(&self, id: &str) -> Option<Relationship> {
        self.state.read().relationships.get(id).cloned()
    }

    pub fn get_entity_relationships(&self, id: &str, direction: Direction) -> Vec<Relationship> {
        let state = self.state.read();
        let mut ids: Vec<String> = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            ids.extend(state.outgoing.get(id).into_iter().flatten().cloned());
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            ids.extend(state.incoming.get(id).into_iter().flatten().cloned());
        }
        ids.sort();
        ids.dedup();
        ids.into_iter().filter_map(|rid| state.relationships.get(&rid).cloned()).collect()
    }

    /// Deterministic breadth-first expansion along `path`: step `i` only
    /// follows outgoing edges of type `path[i]`. An empty path returns the
    /// start entity alone with an empty trace.
    pub fn query(&self, start_id: &str, path: &[String]) -> Result<Vec<QueryResult>, Error> {
        let state = self.state.read();
        let start = state
            .entities
            .get(start_id)
            .cloned()
            .ok_or_else(|| Error::UnknownEntity(start_id.to_string()))?;

        let mut frontier: Vec<(Entity, Vec<String>)> = vec![(start, Vec::new())];
        for relationship_type in path {
            let mut next = Vec::new();
            for (entity, trace) in &frontier {
                let mut rel_ids: Vec<&String> = state.outgoing.get(&entity.id).into_iter().flatten().collect();
                rel_ids.sort();
                for rel_id in rel_ids {
                    let rel = &state.relationships[rel_id];
                    if &rel.relationship_type != relationship_type {
                        continue;
                    }
                    if let Some(target) = state.entities.get(&rel.target_id) {
                        let mut new_trace = trace.clone();
                        new_trace.push(relationship_type.clone());
                        next.push((target.clone(), new_trace));
                    }
                }
            }
            frontier = next;
        }

        Ok(frontier.into_iter().map(|(entity, path)| QueryResult { entity, path }).collect())
    }

    /// Combines vector similarity search over entity embeddings with
    /// bounded structural expansion: vector-search seeds get `hops = 0`,
    /// then each seed expands up to `max_hops` over any relationship type
    /// (either direction). Results are deduplicated by entity, keeping the
    /// minimum hop count, and sorted by (lowest hops, highest similarity).
    pub fn vector_augmented_query(
        &self,
        query_vector: &[f32],
        top_k: usize,
        max_hops: usize,
    ) -> Result<Vec<VectorQueryResult>, Error> {
        let vs = self.vector_store.as_ref().ok_or(Error::VectorStoreNotAttached)?;
        let hits = vs.search(query_vector, top_k, None)?;
        let state = self.state.read();

        let mut vector_to_entity: HashMap<&str, &str> = HashMap::new();
        for entity in state.entities.values() {
            for vid in entity.vector_ids.iter().flatten() {
                vector_to_entity.insert(vid.as_str(), entity.id.as_str());
            }
        }

        let mut hops: HashMap<String, usize> = HashMap::new();
        let mut similarity: HashMap<String, f32> = HashMap::new();
        let mut frontier: Vec<String> = Vec::new();

        // `hits` is already sorted by descending similarity, so the first
        // hit seen for a given entity (entities may own more than one
        // vector id) is its best match; later hits for the same entity
        // must not clobber that similarity.
        for hit in &hits {
            if let Some(&entity_id) = vector_to_entity.get(hit.id.as_str()) {
                if hops.contains_key(entity_id) {
                    continue;
                }
                hops.insert(entity_id.to_string(), 0);
                similarity.insert(entity_id.to_string(), hit.similarity);
                frontier.push(entity_id.to_string());
            }
        }

        for hop in 1..=max_hops {
            let mut next = Vec::new();
            for entity_id in &frontier {
                for neighbor in neighbors(&state, entity_id, None) {
                    if !hops.contains_key(&neighbor) {
                        hops.insert(neighbor.clone(), hop);
                        next.push(neighbor);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let mut results: Vec<VectorQueryResult> = hops
            .into_iter()
            .filter_map(|(id, hop)| {
                state.entities.get(&id).map(|e| VectorQueryResult {
                    entity: e.clone(),
                    similarity: similarity.get(&id).copied().unwrap_or(0.0),
                    hops: hop,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            a.hops
                .cmp(&b.hops)
                .then_with(|| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        Ok(results)
    }

    /// BFS from `seed_ids` (all at depth 0), crossing only edges whose
    /// type is in `relationship_types` when given. Stops once depth would
    /// exceed `max_depth` or the visited count reaches `max_nodes_visited`.
    /// Visit order is stable: seeds in the order given, then per-depth
    /// lexicographic by id.
    pub fn traverse_from_entities_with_depths(
        &self,
        seed_ids: &[String],
        relationship_types: Option<&[String]>,
        max_depth: usize,
        max_nodes_visited: Option<usize>,
    ) -> Vec<(Entity, usize)> {
        let state = self.state.read();
        let mut visited: HashSet<String> = HashSet::new();
        let mut order: Vec<(String, usize)> = Vec::new();
        let within_budget = |order: &[(String, usize)]| max_nodes_visited.map(|m| order.len() < m).unwrap_or(true);

        for seed in seed_ids {
            if !state.entities.contains_key(seed) || visited.contains(seed) {
                continue;
            }
            visited.insert(seed.clone());
            order.push((seed.clone(), 0));
            if !within_budget(&order) {
                return finalize(order, &state);
            }
        }

        let mut frontier: Vec<String> = order.iter().map(|(id, _)| id.clone()).collect();
        let mut depth = 0;
        while depth < max_depth && !frontier.is_empty() {
            depth += 1;
            let mut next_level: HashSet<String> = HashSet::new();
            for entity_id in &frontier {
                for neighbor in neighbors(&state, entity_id, relationship_types) {
                    if !visited.contains(&neighbor) {
                        next_level.insert(neighbor);
                    }
                }
            }
            let mut next_level: Vec<String> = next_level.into_iter().collect();
            next_level.sort();

            let mut this_level = Vec::new();
            for id in next_level {
                if visited.contains(&id) {
                    continue;
                }
                visited.insert(id.clone());
                this_level.push(id);
            }

            for id in &this_level {
                order.push((id.clone(), depth));
                if !within_budget(&order) {
                    return finalize(order, &state);
                }
            }
            frontier = this_level;
        }

        finalize(order, &state)
    }

    /// Flushes dirty entities/relationships to the store, builds the root
    /// record, hands it to the chunker, and records the resulting CID as
    /// this graph's root.
    pub fn update_root_cid(&self) -> Result<Cid, Error> {
        let mut state = self.state.write();

        let dirty_entities: Vec<String> = state.dirty_entities.drain().collect();
        for id in dirty_entities {
            let entity = state.entities[&id].clone();
            let cid = self.store.put_json(&entity)?;
            state.entity_cids.insert(id, cid);
        }

        let dirty_relationships: Vec<String> = state.dirty_relationships.drain().collect();
        for id in dirty_relationships {
            let relationship = state.relationships[&id].clone();
            let cid = self.store.put_json(&relationship)?;
            state.relationship_cids.insert(id, cid);
        }

        let vector_store_cid = match &self.vector_store {
            Some(vs) => Some(cid_to_string(&vs.to_block(self.store.as_ref())?)),
            None => None,
        };

        let mut entity_ids: Vec<String> = state.entities.keys().cloned().collect();
        entity_ids.sort();
        let mut relationship_ids: Vec<String> = state.relationships.keys().cloned().collect();
        relationship_ids.sort();

        let entity_cids: BTreeMap<String, String> =
            state.entity_cids.iter().map(|(k, v)| (k.clone(), cid_to_string(v))).collect();
        let relationship_cids: BTreeMap<String, String> =
            state.relationship_cids.iter().map(|(k, v)| (k.clone(), cid_to_string(v))).collect();

        let record = RootRecord {
            name: self.name.clone(),
            entity_ids,
            entity_cids,
            relationship_ids,
            relationship_cids,
            vector_store_cid,
        };

        let (root_cid, bytes) = chunker::serialize_root(&record, self.store.as_ref(), &self.config)?;
        if bytes.len() > self.config.max_block_size {
            warn!(target: "weave::graph", size = bytes.len(), "root block exceeds max_block_size after chunking");
        }
        state.root_cid = Some(root_cid);
        Ok(root_cid)
    }

    /// Loads a graph given its root CID: resolves any chunk descriptors,
    /// then fetches and decodes every entity/relationship block. The
    /// graph's name is taken from the persisted root record.
    pub fn from_cid(root_cid: &Cid, store: Arc<dyn BlockStore>, config: Config) -> Result<Self, Error> {
        let bytes = store.get(root_cid)?;
        let record = chunker::deserialize_root(&bytes, store.as_ref())?;

        let mut state = GraphState::default();
        for (id, cid_str) in &record.entity_cids {
            let cid = parse_cid(cid_str)?;
            let entity: Entity = store.get_json(&cid)?;
            state.entity_index.entry(entity.entity_type.clone()).or_default().insert(id.clone());
            state.entity_cids.insert(id.clone(), cid);
            state.entities.insert(id.clone(), entity);
        }
        for (id, cid_str) in &record.relationship_cids {
            let cid = parse_cid(cid_str)?;
            let relationship: Relationship = store.get_json(&cid)?;
            state
                .relationship_index
                .entry(relationship.relationship_type.clone())
                .or_default()
                .insert(id.clone());
            state.outgoing.entry(relationship.source_id.clone()).or_default().insert(id.clone());
            state.incoming.entry(relationship.target_id.clone()).or_default().insert(id.clone());
            state.relationship_cids.insert(id.clone(), cid);
            state.relationships.insert(id.clone(), relationship);
        }
        state.root_cid = Some(*root_cid);

        let vector_store = match &record.vector_store_cid {
            Some(cid_str) => {
                let cid = parse_cid(cid_str)?;
                Some(Arc::new(VectorIndex::from_block(&cid, store.as_ref())?))
            }
            None => None,
        };

        Ok(Self {
            name: record.name,
            store,
            config,
            vector_store,
            state: parking_lot::RwLock::new(state),
        })
    }

    /// Persists the current in-memory state and streams every block the
    /// graph owns to `path` as a CAR archive: the root, its chunk
    /// descriptors/shards (if any), every entity and relationship block,
    /// and the vector store block. These are all `raw`-codec leaves with
    /// no DAG-PB links between them, so they're listed explicitly rather
    /// than discovered by the CAR streamer's link-closure walk.
    pub fn export_to_car(&self, path: impl AsRef<Path>) -> Result<Cid, Error> {
        let root_cid = self.update_root_cid()?;
        let root_bytes = self.store.get(&root_cid)?;

        let mut roots = vec![root_cid];
        roots.extend(chunker::collect_chunk_cids(&root_bytes, self.store.as_ref())?);

        let root_value: serde_json::Value =
            crate::json_canon::from_slice(&root_bytes).map_err(crate::store::Error::Json)?;
        if let Some(vector_store_cid) = root_value.get("vector_store_cid").and_then(serde_json::Value::as_str) {
            roots.push(parse_cid(vector_store_cid)?);
        }

        {
            let state = self.state.read();
            roots.extend(state.entity_cids.values().copied());
            roots.extend(state.relationship_cids.values().copied());
        }

        let codec = Codec::default();
        let mut file = std::fs::File::create(path.as_ref()).map_err(crate::store::Error::Io)?;
        crate::car::export_to_writer(&roots, &mut file, self.store.as_ref(), &codec, &CancellationToken::new())?;
        Ok(root_cid)
    }

    /// Imports a CAR archive into a fresh in-memory store and rebuilds the
    /// graph from its first declared root.
    pub fn from_car(path: impl AsRef<Path>, config: Config) -> Result<Self, Error> {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let mut file = std::fs::File::open(path.as_ref()).map_err(crate::store::Error::Io)?;
        let roots = crate::car::import_from_reader(&mut file, store.as_ref(), &CancellationToken::new())?;
        let root = roots
            .first()
            .ok_or_else(|| crate::store::Error::NotFound("CAR archive carried no root".to_string()))?;
        Self::from_cid(root, store, config)
    }
}

fn finalize(order: Vec<(String, usize)>, state: &GraphState) -> Vec<(Entity, usize)> {
    order
        .into_iter()
        .filter_map(|(id, depth)| state.entities.get(&id).map(|e| (e.clone(), depth)))
        .collect()
}
