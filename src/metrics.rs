// SPDX-License-Identifier: Apache-2.0, MIT

//! Query/metrics surface: a passive, explicitly-injected collector for
//! query timing, parameter adaptation, and strategy-effectiveness events.
//!
//! Structurally the same shape as the reference engine's `prometheus`
//! metrics registry (`node/db/src/metrics.rs`), minus the global
//! `lazy_static`/default-registry state: every caller holds (or
//! constructs) its own [`MetricsSink`] and passes it by reference, so
//! tests never fight over shared process-wide counters.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::trace;

/// Bound on how many records any single ring buffer keeps. Older entries
/// are dropped first; this is telemetry, not an audit log.
const MAX_RECORDS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub query_id: String,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub result_count: Option<usize>,
    pub error: Option<String>,
    pub extra_metrics: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub key: String,
    pub at: SystemTime,
    pub details: Value,
}

/// One hour's worth of query activity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HourlyBucket {
    pub query_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone)]
pub enum Anomaly {
    SlowQuery { query_id: String, duration: Duration },
    EmptyResult { query_id: String },
    LowScore { query_id: String, score: f64 },
}

/// Thresholds used by [`InMemoryMetricsSink::anomalies`]. `low_score`
/// only applies to records whose `extra_metrics` carries a numeric
/// `"score"` field.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyThresholds {
    pub max_duration: Duration,
    pub low_score: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(5),
            low_score: 0.1,
        }
    }
}

/// Query/learning/adaptation/strategy event collector. Recorders never
/// raise: a sink is telemetry, and a failure to record must never fail
/// the operation it is observing.
pub trait MetricsSink: Send + Sync {
    fn record_query_start(&self, query_id: &str, params: &Value);
    fn record_query_end(
        &self,
        query_id: &str,
        result_count: Option<usize>,
        error: Option<&str>,
        extra_metrics: Option<&Value>,
    );
    fn record_learning_cycle(&self, key: &str, details: &Value);
    fn record_parameter_adaptation(&self, key: &str, details: &Value);
    fn record_strategy_effectiveness(&self, key: &str, details: &Value);
}

/// Discards everything. The default for callers who don't care.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_query_start(&self, _query_id: &str, _params: &Value) {}
    fn record_query_end(
        &self,
        _query_id: &str,
        _result_count: Option<usize>,
        _error: Option<&str>,
        _extra_metrics: Option<&Value>,
    ) {
    }
    fn record_learning_cycle(&self, _key: &str, _details: &Value) {}
    fn record_parameter_adaptation(&self, _key: &str, _details: &Value) {}
    fn record_strategy_effectiveness(&self, _key: &str, _details: &Value) {}
}

struct InFlight {
    started_at: SystemTime,
    started_instant: Instant,
    params: Value,
}

/// `parking_lot::RwLock`-guarded ring buffers backing the derived-read
/// queries (aggregate counts, success rate, hourly buckets, anomalies).
#[derive(Default)]
pub struct InMemoryMetricsSink {
    in_flight: RwLock<HashMap<String, InFlight>>,
    queries: RwLock<VecDeque<QueryRecord>>,
    learning_cycles: RwLock<VecDeque<EventRecord>>,
    parameter_adaptations: RwLock<VecDeque<EventRecord>>,
    strategy_effectiveness: RwLock<VecDeque<EventRecord>>,
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T) {
    if buf.len() >= MAX_RECORDS {
        buf.pop_front();
    }
    buf.push_back(item);
}

fn hour_epoch(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).map(|d| d.as_secs() / 3600).unwrap_or(0)
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query_count(&self) -> usize {
        self.queries.read().len()
    }

    pub fn success_rate(&self) -> f64 {
        let queries = self.queries.read();
        if queries.is_empty() {
            return 0.0;
        }
        let ok = queries.iter().filter(|q| q.error.is_none()).count();
        ok as f64 / queries.len() as f64
    }

    pub fn average_duration(&self) -> Duration {
        let queries = self.queries.read();
        if queries.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = queries.iter().map(|q| q.duration).sum();
        total / queries.len() as u32
    }

    /// Query counts and error counts bucketed by hour (UNIX epoch hour).
    pub fn hourly_buckets(&self) -> BTreeMap<u64, HourlyBucket> {
        let mut buckets: BTreeMap<u64, HourlyBucket> = BTreeMap::new();
        for record in self.queries.read().iter() {
            let bucket = buckets.entry(hour_epoch(record.started_at)).or_default();
            bucket.query_count += 1;
            if record.error.is_some() {
                bucket.error_count += 1;
            }
        }
        buckets
    }

    /// Flags slow queries, empty-result queries, and (where `extra_metrics`
    /// carries a numeric `"score"`) low-score queries.
    pub fn anomalies(&self, thresholds: &AnomalyThresholds) -> Vec<Anomaly> {
        let mut out = Vec::new();
        for record in self.queries.read().iter() {
            if record.duration > thresholds.max_duration {
                out.push(Anomaly::SlowQuery {
                    query_id: record.query_id.clone(),
                    duration: record.duration,
                });
            }
            if record.result_count == Some(0) {
                out.push(Anomaly::EmptyResult {
                    query_id: record.query_id.clone(),
                });
            }
            if let Some(score) = record.extra_metrics.as_ref().and_then(|v| v.get("score")).and_then(Value::as_f64) {
                if score < thresholds.low_score {
                    out.push(Anomaly::LowScore {
                        query_id: record.query_id.clone(),
                        score,
                    });
                }
            }
        }
        out
    }

    pub fn learning_cycles(&self) -> Vec<EventRecord> {
        self.learning_cycles.read().iter().cloned().collect()
    }

    pub fn parameter_adaptations(&self) -> Vec<EventRecord> {
        self.parameter_adaptations.read().iter().cloned().collect()
    }

    pub fn strategy_effectiveness(&self) -> Vec<EventRecord> {
        self.strategy_effectiveness.read().iter().cloned().collect()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record_query_start(&self, query_id: &str, params: &Value) {
        self.in_flight.write().insert(
            query_id.to_string(),
            InFlight {
                started_at: SystemTime::now(),
                started_instant: Instant::now(),
                params: params.clone(),
            },
        );
    }

    fn record_query_end(
        &self,
        query_id: &str,
        result_count: Option<usize>,
        error: Option<&str>,
        extra_metrics: Option<&Value>,
    ) {
        let Some(started) = self.in_flight.write().remove(query_id) else {
            trace!(target: "weave::metrics", query_id, "query_end with no matching query_start, dropping");
            return;
        };
        let record = QueryRecord {
            query_id: query_id.to_string(),
            started_at: started.started_at,
            duration: started.started_instant.elapsed(),
            result_count,
            error: error.map(str::to_string),
            extra_metrics: extra_metrics.cloned(),
        };
        let _ = &started.params;
        push_bounded(&mut self.queries.write(), record);
    }

    fn record_learning_cycle(&self, key: &str, details: &Value) {
        push_bounded(
            &mut self.learning_cycles.write(),
            EventRecord { key: key.to_string(), at: SystemTime::now(), details: details.clone() },
        );
    }

    fn record_parameter_adaptation(&self, key: &str, details: &Value) {
        push_bounded(
            &mut self.parameter_adaptations.write(),
            EventRecord { key: key.to_string(), at: SystemTime::now(), details: details.clone() },
        );
    }

    fn record_strategy_effectiveness(&self, key: &str, details: &Value) {
        push_bounded(
            &mut self.strategy_effectiveness.write(),
            EventRecord { key: key.to_string(), at: SystemTime::now(), details: details.clone() },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn noop_sink_accepts_everything() {
        let sink = NoopMetricsSink;
        sink.record_query_start("q1", &json!({}));
        sink.record_query_end("q1", Some(3), None, None);
    }

    #[test]
    fn query_end_without_start_is_dropped_silently() {
        let sink = InMemoryMetricsSink::new();
        sink.record_query_end("never-started", Some(1), None, None);
        assert_eq!(sink.query_count(), 0);
    }

    #[test]
    fn success_rate_and_average_duration_are_derived_correctly() {
        let sink = InMemoryMetricsSink::new();
        sink.record_query_start("ok", &json!({}));
        sink.record_query_end("ok", Some(5), None, None);
        sink.record_query_start("err", &json!({}));
        sink.record_query_end("err", None, Some("boom"), None);

        assert_eq!(sink.query_count(), 2);
        assert!((sink.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn anomalies_flag_empty_results_and_low_scores() {
        let sink = InMemoryMetricsSink::new();
        sink.record_query_start("empty", &json!({}));
        sink.record_query_end("empty", Some(0), None, None);

        sink.record_query_start("low", &json!({}));
        sink.record_query_end("low", Some(1), None, Some(&json!({"score": 0.01})));

        let anomalies = sink.anomalies(&AnomalyThresholds::default());
        assert!(anomalies.iter().any(|a| matches!(a, Anomaly::EmptyResult { query_id } if query_id == "empty")));
        assert!(anomalies.iter().any(|a| matches!(a, Anomaly::LowScore { query_id, .. } if query_id == "low")));
    }

    #[test]
    fn hourly_buckets_count_queries_and_errors() {
        let sink = InMemoryMetricsSink::new();
        sink.record_query_start("a", &json!({}));
        sink.record_query_end("a", Some(1), None, None);
        sink.record_query_start("b", &json!({}));
        sink.record_query_end("b", None, Some("fail"), None);

        let buckets = sink.hourly_buckets();
        let total_queries: usize = buckets.values().map(|b| b.query_count).sum();
        let total_errors: usize = buckets.values().map(|b| b.error_count).sum();
        assert_eq!(total_queries, 2);
        assert_eq!(total_errors, 1);
    }

    #[test]
    fn learning_cycle_records_are_retained() {
        let sink = InMemoryMetricsSink::new();
        sink.record_learning_cycle("cycle-1", &json!({"improved": true}));
        let cycles = sink.learning_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].key, "cycle-1");
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let sink = InMemoryMetricsSink::new();
        for i in 0..(MAX_RECORDS + 10) {
            let id = format!("q{i}");
            sink.record_query_start(&id, &json!({}));
            sink.record_query_end(&id, Some(1), None, None);
        }
        assert_eq!(sink.query_count(), MAX_RECORDS);
    }
}
