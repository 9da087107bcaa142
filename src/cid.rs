// SPDX-License-Identifier: Apache-2.0, MIT

//! Content identifiers: the `hash(codec_tag || payload)` primitive every
//! other subsystem addresses blocks by.
//!
//! Grounded on `ipld/cid` in the reference engine: a thin wrapper crate
//! around the `cid`/`multihash` ecosystem types, re-exporting just enough
//! surface for the rest of the workspace to avoid depending on the
//! upstream crates directly.

use multihash_codetable::{Code, MultihashDigest};
use thiserror::Error;

use crate::error::ErrorKind;

/// Multicodec tag for opaque, uninterpreted bytes.
pub const RAW_CODEC: u64 = 0x55;
/// Multicodec tag for a DAG-PB encoded node.
pub const DAG_PB_CODEC: u64 = 0x70;

/// Content identifier. A thin newtype over the upstream `cid::Cid` so the
/// rest of the crate has one stable name to import regardless of which
/// CID crate version is vendored underneath.
pub type Cid = cid::Cid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed CID string: {0}")]
    Malformed(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Malformed(_) => ErrorKind::MalformedCid,
        }
    }
}

/// Computes the content identifier for `payload` under `codec_tag`.
///
/// Deterministic: equal `(codec_tag, payload)` pairs always yield equal
/// CIDs, and the multihash digest is collision-resistant in practice
/// (SHA2-256, 32-byte digest). The hash function is fixed and not
/// configurable at runtime, though [`crate::config::Config::cid_hash`]
/// records the name for callers that want to assert on it.
pub fn compute_cid(codec_tag: u64, payload: &[u8]) -> Cid {
    let digest = Code::Sha2_256.digest(payload);
    Cid::new_v1(codec_tag, digest)
}

/// Renders a CID to its stable textual form (multibase base32, lowercase).
pub fn cid_to_string(c: &Cid) -> String {
    c.to_string()
}

/// Parses a CID from its textual form.
pub fn cid_from_string(s: &str) -> Result<Cid, Error> {
    s.parse::<Cid>()
        .map_err(|e| Error::Malformed(format!("{s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_equal_cid() {
        let a = compute_cid(RAW_CODEC, b"hello world");
        let b = compute_cid(RAW_CODEC, b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn unequal_bytes_unequal_cid() {
        let a = compute_cid(RAW_CODEC, b"hello world");
        let b = compute_cid(RAW_CODEC, b"hello worlD");
        assert_ne!(a, b);
    }

    #[test]
    fn codec_tag_distinguishes_identical_payloads() {
        let a = compute_cid(RAW_CODEC, b"same bytes");
        let b = compute_cid(DAG_PB_CODEC, b"same bytes");
        assert_ne!(a, b);
    }

    #[test]
    fn string_round_trip() {
        let c = compute_cid(DAG_PB_CODEC, b"payload");
        let s = cid_to_string(&c);
        let back = cid_from_string(&s).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn malformed_string_is_rejected() {
        let err = cid_from_string("not-a-cid!!").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedCid);
    }
}
