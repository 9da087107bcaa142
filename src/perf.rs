// SPDX-License-Identifier: Apache-2.0, MIT

//! Performance counters and the generic LRU cache used by the codec.
//!
//! Grounded on the reference engine's `BadBlockCache`
//! (`blockchain/chain_sync/src/bad_block_cache.rs`), which wraps the `lru`
//! crate behind a `parking_lot::Mutex` rather than re-implementing LRU
//! eviction by hand. The `lru` crate's own `get` already mutates recency
//! order, so there is no separate shared/exclusive split here — every
//! access takes the same exclusive lock (see `DESIGN.md`).

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

/// Bounded least-recently-used cache. `get` promotes the entry to
/// most-recently-used; `put` on a full cache evicts the least-recently-used
/// entry.
pub struct Lru<K, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> Lru<K, V> {
    pub fn new(max_size: usize) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("max_size.max(1) is never zero");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Which operation a counter increment or timing sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Encode,
    Decode,
}

/// Monotonic, thread-safe counters for codec activity. All fields are
/// plain atomics; a snapshot is a cheap, consistent-enough read (no global
/// lock needed since every field is independently monotonic).
#[derive(Debug, Default)]
pub struct PerfCounters {
    encode_ops: AtomicU64,
    decode_ops: AtomicU64,
    bytes_encoded: AtomicU64,
    bytes_decoded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    encode_elapsed_ns: AtomicU64,
    decode_elapsed_ns: AtomicU64,
}

/// Point-in-time read of [`PerfCounters`] with derived rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfSnapshot {
    pub encode_ops: u64,
    pub decode_ops: u64,
    pub bytes_encoded: u64,
    pub bytes_decoded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub encode_elapsed_ns: u64,
    pub decode_elapsed_ns: u64,
}

impl PerfSnapshot {
    /// Fraction of codec cache lookups that were hits, in `[0.0, 1.0]`.
    /// `0.0` when there have been no lookups at all.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Encode throughput in bytes/second, derived from accumulated encode
    /// time. `0.0` when no encode work has been timed yet.
    pub fn encode_throughput_bps(&self) -> f64 {
        throughput(self.bytes_encoded, self.encode_elapsed_ns)
    }

    /// Decode throughput in bytes/second.
    pub fn decode_throughput_bps(&self) -> f64 {
        throughput(self.bytes_decoded, self.decode_elapsed_ns)
    }
}

fn throughput(bytes: u64, elapsed_ns: u64) -> f64 {
    if elapsed_ns == 0 {
        0.0
    } else {
        bytes as f64 / (elapsed_ns as f64 / 1_000_000_000.0)
    }
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_encode(&self, bytes: usize, elapsed: Duration) {
        self.encode_ops.fetch_add(1, Ordering::Relaxed);
        self.bytes_encoded.fetch_add(bytes as u64, Ordering::Relaxed);
        self.encode_elapsed_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_decode(&self, bytes: usize, elapsed: Duration) {
        self.decode_ops.fetch_add(1, Ordering::Relaxed);
        self.bytes_decoded.fetch_add(bytes as u64, Ordering::Relaxed);
        self.decode_elapsed_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            encode_ops: self.encode_ops.load(Ordering::Relaxed),
            decode_ops: self.decode_ops.load(Ordering::Relaxed),
            bytes_encoded: self.bytes_encoded.load(Ordering::Relaxed),
            bytes_decoded: self.bytes_decoded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            encode_elapsed_ns: self.encode_elapsed_ns.load(Ordering::Relaxed),
            decode_elapsed_ns: self.decode_elapsed_ns.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache: Lru<u32, &'static str> = Lru::new(2);
        cache.put(1, "a");
        cache.put(2, "b");
        // touch 1 so 2 becomes LRU
        assert_eq!(cache.get(&1), Some("a"));
        cache.put(3, "c");
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.get(&3), Some("c"));
    }

    #[test]
    fn counters_accumulate() {
        let counters = PerfCounters::new();
        counters.record_encode(100, Duration::from_millis(1));
        counters.record_encode(50, Duration::from_millis(1));
        counters.record_cache_hit();
        counters.record_cache_hit();
        counters.record_cache_miss();
        let snap = counters.snapshot();
        assert_eq!(snap.encode_ops, 2);
        assert_eq!(snap.bytes_encoded, 150);
        assert!((snap.cache_hit_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn empty_snapshot_has_zero_rates() {
        let snap = PerfCounters::new().snapshot();
        assert_eq!(snap.cache_hit_rate(), 0.0);
        assert_eq!(snap.encode_throughput_bps(), 0.0);
    }
}
