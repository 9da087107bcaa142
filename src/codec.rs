// SPDX-License-Identifier: Apache-2.0, MIT

//! DAG-PB node codec: canonicalization, encode/decode, and the LRU-backed
//! cache in front of it.
//!
//! The wire format is a hand-rolled protobuf varint/length-delimited
//! encoder rather than a general protobuf runtime (grounded on the
//! reference engine's own preference for minimal hand-rolled framing over
//! `util.rs`'s `ld_read`/`ld_write` in `ipld/car`): the DAG-PB message
//! shape is fixed (two top-level fields, one two/three-field sub-message)
//! so a full codegen'd protobuf runtime would be pure overhead.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use integer_encoding::VarInt;
use thiserror::Error;
use tracing::{debug, trace};

use crate::cid::{compute_cid, Cid, DAG_PB_CODEC};
use crate::config::Config;
use crate::error::ErrorKind;
use crate::perf::{Lru, PerfCounters, PerfSnapshot};

/// A named, ordered link from a [`PBNode`] to another block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PBLink {
    pub name: String,
    pub cid: Cid,
    pub size_hint: Option<u64>,
}

/// Opaque-data-plus-links DAG-PB node, the engine's one structured block
/// shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PBNode {
    pub data: Vec<u8>,
    pub links: Vec<PBLink>,
}

impl PBNode {
    pub fn new(data: Vec<u8>, links: Vec<PBLink>) -> Self {
        Self { data, links }
    }

    /// Canonical form used for equality checks in tests: duplicate links
    /// removed, links sorted, embedded JSON re-minified.
    pub fn canonical(&self) -> PBNode {
        optimize_node_structure(self.clone())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("corrupt block: {0}")]
    CorruptBlock(String),
    #[error("CID mismatch: expected {expected}, computed {actual}")]
    CidMismatch { expected: String, actual: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CorruptBlock(_) => ErrorKind::CorruptBlock,
            Error::CidMismatch { .. } => ErrorKind::CidMismatch,
        }
    }
}

/// Canonicalization step applied inside `encode_node`:
/// 1. dedupe links by `(name, cid)`,
/// 2. sort by name ascending (ties by CID bytes),
/// 3. re-minify `data` if it parses as JSON.
pub fn optimize_node_structure(mut node: PBNode) -> PBNode {
    node.links.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.cid.to_bytes().cmp(&b.cid.to_bytes())));
    node.links.dedup_by(|a, b| a.name == b.name && a.cid == b.cid);

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&node.data) {
        if let Ok(minified) = serde_json::to_vec(&value) {
            node.data = minified;
        }
    }
    node
}

fn canonical_cache_key(node: &PBNode) -> u64 {
    let mut hasher = DefaultHasher::new();
    node.hash(&mut hasher);
    hasher.finish()
}

// --- wire format -----------------------------------------------------

fn write_tag(out: &mut Vec<u8>, field: u32, wire_type: u32) {
    let tag = (u64::from(field) << 3) | u64::from(wire_type);
    out.extend_from_slice(&tag.encode_var_vec());
}

fn write_len_delimited(out: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    write_tag(out, field, 2);
    out.extend_from_slice(&(bytes.len() as u64).encode_var_vec());
    out.extend_from_slice(bytes);
}

fn write_varint_field(out: &mut Vec<u8>, field: u32, val: u64) {
    write_tag(out, field, 0);
    out.extend_from_slice(&val.encode_var_vec());
}

fn encode_link(link: &PBLink) -> Vec<u8> {
    let mut buf = Vec::new();
    write_len_delimited(&mut buf, 1, &link.cid.to_bytes());
    write_len_delimited(&mut buf, 2, link.name.as_bytes());
    if let Some(tsize) = link.size_hint {
        write_varint_field(&mut buf, 3, tsize);
    }
    buf
}

/// Serializes a node that has already been canonicalized. Links (field 2)
/// are emitted before data (field 1), a historical dag-pb field-order
/// quirk this codec reproduces on purpose for wire compatibility.
fn encode_pbnode(node: &PBNode) -> Vec<u8> {
    let mut buf = Vec::new();
    for link in &node.links {
        write_len_delimited(&mut buf, 2, &encode_link(link));
    }
    if !node.data.is_empty() {
        write_len_delimited(&mut buf, 1, &node.data);
    }
    buf
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, Error> {
    let (val, n) = u64::decode_var(&buf[*pos..])
        .ok_or_else(|| Error::CorruptBlock("truncated varint".to_string()))?;
    *pos += n;
    Ok(val)
}

fn read_tag(buf: &[u8], pos: &mut usize) -> Result<(u32, u32), Error> {
    let tag = read_varint(buf, pos)?;
    Ok(((tag >> 3) as u32, (tag & 0x7) as u32))
}

fn read_len_delimited<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], Error> {
    let len = read_varint(buf, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| Error::CorruptBlock("length-delimited field overruns buffer".to_string()))?;
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

fn skip_field(buf: &[u8], pos: &mut usize, wire_type: u32) -> Result<(), Error> {
    match wire_type {
        0 => {
            read_varint(buf, pos)?;
        }
        2 => {
            read_len_delimited(buf, pos)?;
        }
        other => {
            return Err(Error::CorruptBlock(format!("unsupported wire type {other}")));
        }
    }
    Ok(())
}

fn decode_pblink(bytes: &[u8]) -> Result<PBLink, Error> {
    let mut pos = 0;
    let mut hash = None;
    let mut name = None;
    let mut tsize = None;
    while pos < bytes.len() {
        let (field, wire) = read_tag(bytes, &mut pos)?;
        match (field, wire) {
            (1, 2) => hash = Some(read_len_delimited(bytes, &mut pos)?.to_vec()),
            (2, 2) => {
                let raw = read_len_delimited(bytes, &mut pos)?.to_vec();
                name = Some(
                    String::from_utf8(raw)
                        .map_err(|e| Error::CorruptBlock(format!("link name not utf-8: {e}")))?,
                );
            }
            (3, 0) => tsize = Some(read_varint(bytes, &mut pos)?),
            (_, wire) => skip_field(bytes, &mut pos, wire)?,
        }
    }
    let hash = hash.ok_or_else(|| Error::CorruptBlock("link missing Hash field".to_string()))?;
    let cid = Cid::try_from(hash.as_slice())
        .map_err(|e| Error::CorruptBlock(format!("link CID undecodable: {e}")))?;
    Ok(PBLink {
        name: name.unwrap_or_default(),
        cid,
        size_hint: tsize,
    })
}

fn decode_pbnode(bytes: &[u8]) -> Result<PBNode, Error> {
    let mut pos = 0;
    let mut data = Vec::new();
    let mut links = Vec::new();
    while pos < bytes.len() {
        let (field, wire) = read_tag(bytes, &mut pos)?;
        match (field, wire) {
            (1, 2) => data = read_len_delimited(bytes, &mut pos)?.to_vec(),
            (2, 2) => {
                let sub = read_len_delimited(bytes, &mut pos)?;
                links.push(decode_pblink(sub)?);
            }
            (_, wire) => skip_field(bytes, &mut pos, wire)?,
        }
    }
    Ok(PBNode { data, links })
}

// --- codec facade ------------------------------------------------------

/// Encode/decode facade with an LRU cache and performance counters.
pub struct Codec {
    cache: Lru<u64, (Vec<u8>, Cid)>,
    counters: Arc<PerfCounters>,
}

impl Codec {
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache: Lru::new(cache_size),
            counters: Arc::new(PerfCounters::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.codec_cache_size)
    }

    pub fn perf_snapshot(&self) -> PerfSnapshot {
        self.counters.snapshot()
    }

    /// Canonicalizes, serializes, and computes the CID for `node`. Cached
    /// by a pre-hash of the canonical form: repeated calls with
    /// structurally-equal nodes (ignoring link order/duplicates) hit the
    /// cache and skip re-serialization.
    pub fn encode_node(&self, node: &PBNode) -> (Vec<u8>, Cid) {
        let canon = optimize_node_structure(node.clone());
        let key = canonical_cache_key(&canon);

        if let Some(cached) = self.cache.get(&key) {
            self.counters.record_cache_hit();
            trace!(target: "weave::codec", %key, "codec cache hit");
            return cached;
        }
        self.counters.record_cache_miss();

        let start = Instant::now();
        let bytes = encode_pbnode(&canon);
        let cid = compute_cid(DAG_PB_CODEC, &bytes);
        self.counters.record_encode(bytes.len(), start.elapsed());

        self.cache.put(key, (bytes.clone(), cid));
        debug!(target: "weave::codec", %cid, bytes = bytes.len(), "encoded dag-pb node");
        (bytes, cid)
    }

    /// Encodes every node in order, preserving input order in the output.
    pub fn encode_batch(&self, nodes: &[PBNode]) -> Vec<(Vec<u8>, Cid)> {
        nodes.iter().map(|n| self.encode_node(n)).collect()
    }

    /// Decodes `bytes` into a [`PBNode`], re-verifying that `expected`
    /// matches the CID recomputed from the bytes.
    pub fn decode_block(&self, bytes: &[u8], expected: &Cid) -> Result<PBNode, Error> {
        let start = Instant::now();
        let node = decode_pbnode(bytes)?;

        let actual = compute_cid(DAG_PB_CODEC, bytes);
        if &actual != expected {
            return Err(Error::CidMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        self.counters.record_decode(bytes.len(), start.elapsed());
        Ok(node)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(name: &str, payload: &[u8]) -> PBLink {
        PBLink {
            name: name.to_string(),
            cid: compute_cid(crate::cid::RAW_CODEC, payload),
            size_hint: Some(payload.len() as u64),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let codec = Codec::default();
        let node = PBNode::new(b"{\"a\": 1}".to_vec(), vec![link("b", b"1"), link("a", b"2")]);
        let (bytes, cid) = codec.encode_node(&node);
        let decoded = codec.decode_block(&bytes, &cid).unwrap();
        assert_eq!(decoded.canonical(), node.canonical());
    }

    #[test]
    fn encode_cid_matches_compute_cid() {
        let codec = Codec::default();
        let node = PBNode::new(b"hello".to_vec(), vec![]);
        let (bytes, cid) = codec.encode_node(&node);
        assert_eq!(cid, compute_cid(DAG_PB_CODEC, &bytes));
    }

    #[test]
    fn link_order_and_duplicates_are_canonicalized() {
        let codec = Codec::default();
        let a = link("x", b"1");
        let b = link("y", b"2");

        let n1 = PBNode::new(vec![], vec![b.clone(), a.clone()]);
        let n2 = PBNode::new(vec![], vec![a.clone(), a.clone(), b.clone()]);

        let (bytes1, cid1) = codec.encode_node(&n1);
        let (bytes2, cid2) = codec.encode_node(&n2);
        assert_eq!(bytes1, bytes2);
        assert_eq!(cid1, cid2);
    }

    #[test]
    fn json_data_is_minified() {
        let node = PBNode::new(b"{  \"a\" :  1 ,  \"b\": [1, 2] }".to_vec(), vec![]);
        let canon = optimize_node_structure(node);
        assert_eq!(canon.data, serde_json::to_vec(&serde_json::json!({"a": 1, "b": [1, 2]})).unwrap());
    }

    #[test]
    fn non_json_data_is_left_untouched() {
        let node = PBNode::new(b"not json at all".to_vec(), vec![]);
        let canon = optimize_node_structure(node.clone());
        assert_eq!(canon.data, node.data);
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        let codec = Codec::default();
        let bogus_cid = compute_cid(DAG_PB_CODEC, b"whatever");
        let err = codec.decode_block(&[0xff, 0xff, 0xff], &bogus_cid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptBlock);
    }

    #[test]
    fn cid_mismatch_is_detected_on_decode() {
        let codec = Codec::default();
        let node = PBNode::new(b"real".to_vec(), vec![]);
        let (bytes, _) = codec.encode_node(&node);
        let wrong_cid = compute_cid(DAG_PB_CODEC, b"not the real payload");
        let err = codec.decode_block(&bytes, &wrong_cid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CidMismatch);
    }

    #[test]
    fn cache_hits_are_recorded_and_output_is_stable() {
        let codec = Codec::default();
        let node = PBNode::new(b"cached".to_vec(), vec![link("l", b"x")]);

        let first = codec.encode_node(&node);
        for _ in 0..99 {
            let again = codec.encode_node(&node);
            assert_eq!(again, first);
        }
        let snap = codec.perf_snapshot();
        assert!(snap.cache_hits >= 99);
    }

    #[test]
    fn batch_preserves_order_and_matches_individual_encode() {
        let codec = Codec::default();
        let nodes = vec![
            PBNode::new(b"1".to_vec(), vec![]),
            PBNode::new(b"2".to_vec(), vec![]),
            PBNode::new(b"3".to_vec(), vec![]),
        ];
        let batch = codec.encode_batch(&nodes);
        for (node, (bytes, cid)) in nodes.iter().zip(batch.iter()) {
            let (single_bytes, single_cid) = codec.encode_node(node);
            assert_eq!(*bytes, single_bytes);
            assert_eq!(*cid, single_cid);
        }
    }

    /// A link set built from small arbitrary name/payload pairs, shrunk by
    /// `quickcheck` like any other `Vec`.
    #[derive(Clone, Debug)]
    struct ArbitraryLinks(Vec<(String, Vec<u8>)>);

    impl quickcheck::Arbitrary for ArbitraryLinks {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            let len = usize::arbitrary(g) % 6;
            let pairs = (0..len)
                .map(|_| {
                    let name = (u8::arbitrary(g) % 4).to_string();
                    let payload = vec![u8::arbitrary(g)];
                    (name, payload)
                })
                .collect();
            ArbitraryLinks(pairs)
        }
    }

    fn links_from(pairs: &[(String, Vec<u8>)]) -> Vec<PBLink> {
        pairs
            .iter()
            .map(|(name, payload)| link(name, payload))
            .collect()
    }

    /// Canonicalization law from the spec: any permutation of a link list,
    /// with arbitrary duplicates thrown in, encodes to the same bytes once
    /// `optimize_node_structure` has deduped and sorted it.
    #[quickcheck_macros::quickcheck]
    fn permuting_or_duplicating_links_never_changes_encoded_output(links: ArbitraryLinks) -> bool {
        let codec = Codec::default();
        let original = links_from(&links.0);

        let mut shuffled = original.clone();
        shuffled.reverse();
        shuffled.extend(original.iter().cloned());

        let (bytes_a, cid_a) = codec.encode_node(&PBNode::new(vec![], original));
        let (bytes_b, cid_b) = codec.encode_node(&PBNode::new(vec![], shuffled));
        bytes_a == bytes_b && cid_a == cid_b
    }

    /// `encode_node`'s CID always equals `compute_cid` applied to its own
    /// output bytes, for any data/link combination `quickcheck` generates.
    #[quickcheck_macros::quickcheck]
    fn encoded_cid_always_matches_compute_cid_over_output_bytes(data: Vec<u8>, links: ArbitraryLinks) -> bool {
        let codec = Codec::default();
        let node = PBNode::new(data, links_from(&links.0));
        let (bytes, cid) = codec.encode_node(&node);
        cid == compute_cid(DAG_PB_CODEC, &bytes)
    }
}
