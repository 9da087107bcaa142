// SPDX-License-Identifier: Apache-2.0, MIT

//! `weave` is a content-addressed IPLD storage and knowledge-graph engine:
//! CIDs and a hand-rolled DAG-PB codec at the bottom, a pluggable block
//! store and CAR streaming in the middle, and a vector-augmented
//! knowledge graph with transparent large-root chunking on top.
//!
//! Every block, wherever it lives, is addressed by [`cid::Cid`]: equal
//! content always hashes to the same identifier, so two callers who store
//! the same bytes converge on the same block without coordinating.

pub mod car;
pub mod chunker;
pub mod cid;
pub mod codec;
pub mod config;
pub mod error;
pub mod graph;
pub mod json_canon;
pub mod metrics;
pub mod perf;
pub mod store;
pub mod vector;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use graph::KnowledgeGraph;
pub use store::{BlockStore, FsBlockStore, MemoryBlockStore};
