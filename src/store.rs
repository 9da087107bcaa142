// SPDX-License-Identifier: Apache-2.0, MIT

//! Content-addressed block store: put/get by CID, batch variants, and a
//! JSON convenience layer built on [`crate::json_canon`].
//!
//! Two backends ship, both behind the same [`BlockStore`] trait (grounded
//! on the `Store`/`Blockstore` trait split in `node/db/src/traits.rs` and
//! `ipld/blockstore`): an in-memory map (grounded on `node/db/src/memory.rs`'s
//! `MemoryDB`) for tests and ephemeral use, and a one-file-per-block
//! filesystem backend for durable use, with atomic write-temp/fsync/rename
//! on every write.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cid::{cid_from_string, cid_to_string, compute_cid, Cid, RAW_CODEC};
use crate::error::ErrorKind;
use crate::json_canon;

#[derive(Debug, Error)]
pub enum Error {
    #[error("block not found: {0}")]
    NotFound(String),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cid in store key: {0}")]
    MalformedCid(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Io(_) => ErrorKind::IoFailure,
            Error::MalformedCid(_) => ErrorKind::MalformedCid,
            Error::Json(_) => ErrorKind::Other,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Cooperative cancellation flag shared with long-running store
/// operations (batch put, CAR export/import). Checked between units of
/// work; never interrupts one in flight.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<std::sync::atomic::AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Storage backend contract. Any implementation satisfying put/get
/// suffices; the engine ships [`MemoryBlockStore`] and [`FsBlockStore`].
pub trait BlockStore: Send + Sync {
    /// Stores `bytes` verbatim under the caller-supplied `cid` (used for
    /// DAG-PB blocks, whose CID is computed by the codec under the
    /// `dag-pb` multicodec tag rather than the store's own `raw` tag).
    fn put_keyed(&self, cid: &Cid, bytes: &[u8]) -> Result<(), Error>;

    fn get(&self, cid: &Cid) -> Result<Vec<u8>, Error>;

    fn has(&self, cid: &Cid) -> Result<bool, Error>;

    /// Stores opaque `bytes` under their `raw`-codec CID and returns it.
    fn put(&self, bytes: &[u8]) -> Result<Cid, Error> {
        let cid = compute_cid(RAW_CODEC, bytes);
        self.put_keyed(&cid, bytes)?;
        Ok(cid)
    }

    /// All-or-nothing batch put: every block is durably stored before any
    /// CID is returned. Preserves input order. Checked against `cancel`
    /// between blocks, same granularity as CAR export/import.
    fn put_batch(&self, items: &[Vec<u8>], cancel: &CancellationToken) -> Result<Vec<Cid>, Error> {
        let cids: Vec<Cid> = items.iter().map(|b| compute_cid(RAW_CODEC, b)).collect();
        for (cid, bytes) in cids.iter().zip(items) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.put_keyed(cid, bytes)?;
        }
        Ok(cids)
    }

    fn get_batch(&self, cids: &[Cid], cancel: &CancellationToken) -> Result<Vec<Vec<u8>>, Error> {
        cids.iter()
            .map(|c| {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.get(c)
            })
            .collect()
    }
}

/// JSON convenience layer over [`BlockStore`]: a separate, generic-method
/// extension trait rather than methods on `BlockStore` itself, since
/// `<T: Serialize>` methods would make `BlockStore` unusable as a trait
/// object — and the codec, CAR streamer, chunker, and knowledge graph all
/// hold a `dyn BlockStore`, not a concrete backend type. Blanket-implemented
/// for every `BlockStore`, including `dyn BlockStore`, so call sites read
/// exactly like inherent methods.
pub trait BlockStoreExt: BlockStore {
    /// Stores `value` as canonical JSON under its `raw`-codec CID.
    fn put_json<T: Serialize>(&self, value: &T) -> Result<Cid, Error> {
        let bytes = json_canon::to_canonical_vec(value)?;
        self.put(&bytes)
    }

    /// Inverse of [`BlockStoreExt::put_json`].
    fn get_json<T: DeserializeOwned>(&self, cid: &Cid) -> Result<T, Error> {
        let bytes = self.get(cid)?;
        Ok(json_canon::from_slice(&bytes)?)
    }

    fn put_json_batch<T: Serialize>(
        &self,
        values: &[T],
        cancel: &CancellationToken,
    ) -> Result<Vec<Cid>, Error> {
        let encoded: Vec<Vec<u8>> = values
            .iter()
            .map(json_canon::to_canonical_vec)
            .collect::<serde_json::Result<_>>()?;
        self.put_batch(&encoded, cancel)
    }

    fn get_json_batch<T: DeserializeOwned>(
        &self,
        cids: &[Cid],
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, Error> {
        self.get_batch(cids, cancel)?
            .into_iter()
            .map(|bytes| Ok(json_canon::from_slice(&bytes)?))
            .collect()
    }
}

impl<S: BlockStore + ?Sized> BlockStoreExt for S {}

/// Thread-safe in-memory block store, grounded on `node/db/src/memory.rs`'s
/// `MemoryDB`.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    fn put_keyed(&self, cid: &Cid, bytes: &[u8]) -> Result<(), Error> {
        self.blocks.write().insert(cid.to_bytes(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        self.blocks
            .read()
            .get(&cid.to_bytes())
            .cloned()
            .ok_or_else(|| Error::NotFound(cid_to_string(cid)))
    }

    fn has(&self, cid: &Cid) -> Result<bool, Error> {
        Ok(self.blocks.read().contains_key(&cid.to_bytes()))
    }
}

/// Filesystem block store: one file per block, named by the block's
/// textual CID. Writes are atomic (write to a sibling temp file, fsync,
/// rename over the target) so a crash mid-write never exposes a partial
/// block under its final name.
pub struct FsBlockStore {
    root: PathBuf,
}

impl FsBlockStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, cid: &Cid) -> PathBuf {
        self.root.join(cid_to_string(cid))
    }
}

impl BlockStore for FsBlockStore {
    fn put_keyed(&self, cid: &Cid, bytes: &[u8]) -> Result<(), Error> {
        let target = self.path_for(cid);
        if target.exists() {
            // Content-addressed: identical CID implies identical bytes already on disk.
            return Ok(());
        }
        let tmp = self.root.join(format!(".{}.tmp", cid_to_string(cid)));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        debug!(target: "weave::store", %cid, bytes = bytes.len(), "wrote block");
        Ok(())
    }

    fn get(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        let path = self.path_for(cid);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(cid_to_string(cid))
            } else {
                warn!(target: "weave::store", %cid, error = %e, "block read failed");
                Error::Io(e)
            }
        })
    }

    fn has(&self, cid: &Cid) -> Result<bool, Error> {
        Ok(self.path_for(cid).exists())
    }
}

/// Parses a textual CID used as a store key, surfacing a store-level
/// error rather than a bare CID-module error.
pub fn parse_cid(s: &str) -> Result<Cid, Error> {
    cid_from_string(s).map_err(|e| Error::MalformedCid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_round_trips_bytes() {
        let store = MemoryBlockStore::new();
        let cid = store.put(b"hello world").unwrap();
        assert_eq!(store.get(&cid).unwrap(), b"hello world");
    }

    #[test]
    fn get_missing_cid_is_not_found() {
        let store = MemoryBlockStore::new();
        let cid = compute_cid(RAW_CODEC, b"never stored");
        let err = store.get(&cid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn batch_put_preserves_order() {
        let store = MemoryBlockStore::new();
        let items = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let cancel = CancellationToken::new();
        let cids = store.put_batch(&items, &cancel).unwrap();
        let fetched = store.get_batch(&cids, &cancel).unwrap();
        assert_eq!(fetched, items);
    }

    #[test]
    fn batch_put_stops_when_cancelled() {
        let store = MemoryBlockStore::new();
        let items = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store.put_batch(&items, &cancel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn json_round_trip_is_deterministic_across_key_order() {
        let store = MemoryBlockStore::new();
        let a = json!({"z": 1, "a": 2});
        let b = json!({"a": 2, "z": 1});
        let cid_a = store.put_json(&a).unwrap();
        let cid_b = store.put_json(&b).unwrap();
        assert_eq!(cid_a, cid_b);
        let back: serde_json::Value = store.get_json(&cid_a).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn fs_store_round_trips_and_is_atomic_on_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlockStore::open(dir.path()).unwrap();
        let cid = store.put(b"durable bytes").unwrap();
        assert_eq!(store.get(&cid).unwrap(), b"durable bytes");
        // Re-putting identical bytes under the same CID is a no-op, not a corruption risk.
        store.put_keyed(&cid, b"durable bytes").unwrap();
        assert_eq!(store.get(&cid).unwrap(), b"durable bytes");
    }

    #[test]
    fn fs_store_missing_block_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlockStore::open(dir.path()).unwrap();
        let cid = compute_cid(RAW_CODEC, b"absent");
        let err = store.get(&cid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
