//! Metrics sink: counters, gauges, and latency histograms keyed by provider
//! and kind, exposed as a JSON snapshot.
//!
//! Counters and gauges are plain atomics. Histograms accumulate into a small
//! set of shards picked round-robin so concurrent writers rarely contend;
//! shards are merged at snapshot time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

/// Number of accumulation shards per histogram.
const HISTOGRAM_SHARDS: usize = 4;

/// Upper bounds (milliseconds) of the latency histogram buckets; the last
/// bucket is unbounded.
const LATENCY_BOUNDS_MS: [u64; 8] = [25, 50, 100, 250, 500, 1_000, 5_000, 30_000];

/// Identifies one metric series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MetricKey {
    /// Metric name, e.g. `requests_total`.
    pub name: &'static str,
    /// Provider label, empty for gateway-wide series.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub provider: String,
    /// Kind label (error kind, event kind), empty when unused.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

impl MetricKey {
    /// A gateway-wide series.
    pub fn global(name: &'static str) -> Self {
        Self {
            name,
            provider: String::new(),
            kind: String::new(),
        }
    }

    /// A per-provider series.
    pub fn provider(name: &'static str, provider: impl Into<String>) -> Self {
        Self {
            name,
            provider: provider.into(),
            kind: String::new(),
        }
    }

    /// A per-provider, per-kind series.
    pub fn provider_kind(
        name: &'static str,
        provider: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            name,
            provider: provider.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Default)]
struct HistogramShard {
    count: AtomicU64,
    sum_ms: AtomicU64,
    buckets: [AtomicU64; LATENCY_BOUNDS_MS.len().saturating_add(1)],
}

struct Histogram {
    shards: [HistogramShard; HISTOGRAM_SHARDS],
    next_shard: AtomicUsize,
}

impl Histogram {
    fn new() -> Self {
        Self {
            shards: [
                HistogramShard::default(),
                HistogramShard::default(),
                HistogramShard::default(),
                HistogramShard::default(),
            ],
            next_shard: AtomicUsize::new(0),
        }
    }

    fn record(&self, millis: u64) {
        let index = self.next_shard.fetch_add(1, Ordering::Relaxed) % HISTOGRAM_SHARDS;
        let shard = &self.shards[index];
        shard.count.fetch_add(1, Ordering::Relaxed);
        shard.sum_ms.fetch_add(millis, Ordering::Relaxed);
        let bucket = LATENCY_BOUNDS_MS
            .iter()
            .position(|bound| millis <= *bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        shard.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    fn merge(&self) -> HistogramSample {
        let mut count = 0u64;
        let mut sum_ms = 0u64;
        let mut buckets = vec![0u64; LATENCY_BOUNDS_MS.len().saturating_add(1)];
        for shard in &self.shards {
            count = count.saturating_add(shard.count.load(Ordering::Relaxed));
            sum_ms = sum_ms.saturating_add(shard.sum_ms.load(Ordering::Relaxed));
            for (merged, bucket) in buckets.iter_mut().zip(shard.buckets.iter()) {
                *merged = merged.saturating_add(bucket.load(Ordering::Relaxed));
            }
        }
        HistogramSample {
            count,
            sum_ms,
            bounds_ms: LATENCY_BOUNDS_MS.to_vec(),
            buckets,
        }
    }
}

/// A merged histogram for the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSample {
    /// Total observations.
    pub count: u64,
    /// Sum of observed milliseconds.
    pub sum_ms: u64,
    /// Bucket upper bounds in milliseconds; one extra unbounded bucket.
    pub bounds_ms: Vec<u64>,
    /// Observation counts per bucket.
    pub buckets: Vec<u64>,
}

/// Point-in-time view of every metric series.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Counter values.
    pub counters: BTreeMap<String, u64>,
    /// Gauge values.
    pub gauges: BTreeMap<String, i64>,
    /// Merged histograms.
    pub histograms: BTreeMap<String, HistogramSample>,
}

/// Concurrent metrics sink.
#[derive(Default)]
pub struct MetricsSink {
    counters: RwLock<BTreeMap<MetricKey, Arc<AtomicU64>>>,
    gauges: RwLock<BTreeMap<MetricKey, Arc<AtomicI64>>>,
    histograms: RwLock<BTreeMap<MetricKey, Arc<Histogram>>>,
}

impl MetricsSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn incr(&self, key: MetricKey) {
        self.counter(key).fetch_add(1, Ordering::Relaxed);
    }

    /// Add to a counter.
    pub fn add(&self, key: MetricKey, value: u64) {
        self.counter(key).fetch_add(value, Ordering::Relaxed);
    }

    /// Set a gauge.
    pub fn set_gauge(&self, key: MetricKey, value: i64) {
        let handle = {
            let read = self.gauges.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            read.get(&key).cloned()
        };
        let handle = handle.unwrap_or_else(|| {
            let mut write = self
                .gauges
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(write.entry(key).or_insert_with(|| Arc::new(AtomicI64::new(0))))
        });
        handle.store(value, Ordering::Relaxed);
    }

    /// Record a latency observation in milliseconds.
    pub fn observe_ms(&self, key: MetricKey, millis: u64) {
        let handle = {
            let read = self
                .histograms
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            read.get(&key).cloned()
        };
        let handle = handle.unwrap_or_else(|| {
            let mut write = self
                .histograms
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(write.entry(key).or_insert_with(|| Arc::new(Histogram::new())))
        });
        handle.record(millis);
    }

    /// Current value of a counter, zero when never touched.
    pub fn counter_value(&self, key: &MetricKey) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Snapshot every series for the metrics endpoint.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(key, value)| (render_key(key), value.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(key, value)| (render_key(key), value.load(Ordering::Relaxed)))
            .collect();
        let histograms = self
            .histograms
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(key, histogram)| (render_key(key), histogram.merge()))
            .collect();
        MetricsSnapshot {
            counters,
            gauges,
            histograms,
        }
    }

    fn counter(&self, key: MetricKey) -> Arc<AtomicU64> {
        {
            let read = self
                .counters
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(existing) = read.get(&key) {
                return Arc::clone(existing);
            }
        }
        let mut write = self
            .counters
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(write.entry(key).or_insert_with(|| Arc::new(AtomicU64::new(0))))
    }
}

/// Flatten a key into the `name{provider=..,kind=..}` form used in snapshots.
fn render_key(key: &MetricKey) -> String {
    match (key.provider.is_empty(), key.kind.is_empty()) {
        (true, true) => key.name.to_owned(),
        (false, true) => format!("{}{{provider={}}}", key.name, key.provider),
        (true, false) => format!("{}{{kind={}}}", key.name, key.kind),
        (false, false) => format!(
            "{}{{provider={},kind={}}}",
            key.name, key.provider, key.kind
        ),
    }
}
