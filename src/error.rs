// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Top-level error type returned by every public `weave` operation.
///
/// Wraps the per-subsystem error types via `#[from]`, following the
/// aggregation pattern used for chain-sync errors: each subsystem keeps its
/// own enum, and the facade only adds a variant when a new subsystem is
/// wired in.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cid error: {0}")]
    Cid(#[from] crate::cid::Error),

    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::Error),

    #[error("store error: {0}")]
    Store(#[from] crate::store::Error),

    #[error("vector index error: {0}")]
    Vector(#[from] crate::vector::Error),

    #[error("knowledge graph error: {0}")]
    Graph(#[from] crate::graph::Error),

    #[error("{0}")]
    Other(String),
}

/// Stable, matchable error classification independent of the `Display`
/// message. Callers that need to branch on failure mode (retry, surface to
/// user, abort) should match on this rather than parsing error text.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    CorruptBlock,
    CidMismatch,
    MalformedCid,
    RootTooLarge,
    DimensionMismatch,
    ZeroNormVector,
    UnknownEntity,
    IoFailure,
    Cancelled,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Cid(e) => e.kind(),
            Error::Codec(e) => e.kind(),
            Error::Store(e) => e.kind(),
            Error::Vector(e) => e.kind(),
            Error::Graph(e) => e.kind(),
            Error::Other(_) => ErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
