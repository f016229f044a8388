//! Thread-safe metrics accumulation.
//!
//! Hot counters (`AtomicU64`) are incremented directly from worker and
//! dispatcher threads with no locking; only the drop-reason histogram and
//! the rolling-mean computation need a mutex, the same split the teacher
//! crate uses between its atomics-based output accounting and the
//! necessarily-serialized parts of its own bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::types::{BuildResult, MetricsSnapshot};

pub struct MetricsAccumulator {
    total_builds: AtomicU64,
    successful_builds: AtomicU64,
    failed_builds: AtomicU64,
    cache_hits: AtomicU64,
    dropped_tasks: AtomicU64,
    dropped_results: AtomicU64,
    total_duration_ns: AtomicU64,
    current_parallelism: AtomicU64,
    peak_parallelism: AtomicU64,
    drop_reasons: Mutex<HashMap<String, u64>>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self {
            total_builds: AtomicU64::new(0),
            successful_builds: AtomicU64::new(0),
            failed_builds: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            dropped_tasks: AtomicU64::new(0),
            dropped_results: AtomicU64::new(0),
            total_duration_ns: AtomicU64::new(0),
            current_parallelism: AtomicU64::new(0),
            peak_parallelism: AtomicU64::new(0),
            drop_reasons: Mutex::new(HashMap::new()),
        }
    }

    /// Records the outcome of one completed build: totals, success/failure
    /// split, cache hits, and the running duration sum (the mean is
    /// recomputed lazily in [`Self::snapshot`], not maintained live).
    pub fn record_build(&self, result: &BuildResult) {
        self.total_builds.fetch_add(1, Ordering::Relaxed);
        if result.error.is_none() {
            self.successful_builds.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_builds.fetch_add(1, Ordering::Relaxed);
        }
        if result.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ns
            .fetch_add(result.duration_ns, Ordering::Relaxed);
    }

    pub fn record_dropped_task(&self, _component_name: &str, reason: &str) {
        self.dropped_tasks.fetch_add(1, Ordering::Relaxed);
        self.bump_drop_reason(reason);
    }

    pub fn record_dropped_result(&self, _component_name: &str, reason: &str) {
        self.dropped_results.fetch_add(1, Ordering::Relaxed);
        self.bump_drop_reason(reason);
    }

    fn bump_drop_reason(&self, reason: &str) {
        let mut reasons = self.drop_reasons.lock().expect("drop reason lock poisoned");
        *reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    /// Updates current and peak parallelism. Peak is monotone: a
    /// compare-and-set loop only ever raises it, never lowers it, even if
    /// `concurrency` observed here is momentarily stale by the time the CAS
    /// runs (another thread may have already raised the peak further).
    pub fn record_parallel_processing(&self, concurrency: u64) {
        self.current_parallelism.store(concurrency, Ordering::Relaxed);
        let mut observed = self.peak_parallelism.load(Ordering::Relaxed);
        while concurrency > observed {
            match self.peak_parallelism.compare_exchange_weak(
                observed,
                concurrency,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => observed = current,
            }
        }
    }

    /// Returns an independent copy of the current metrics, so callers
    /// never race with ongoing updates while reading.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_builds.load(Ordering::Relaxed);
        let total_duration = self.total_duration_ns.load(Ordering::Relaxed);
        let average_duration_ns = if total == 0 {
            0.0
        } else {
            total_duration as f64 / total as f64
        };
        MetricsSnapshot {
            total_builds: total,
            successful_builds: self.successful_builds.load(Ordering::Relaxed),
            failed_builds: self.failed_builds.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            dropped_tasks: self.dropped_tasks.load(Ordering::Relaxed),
            dropped_results: self.dropped_results.load(Ordering::Relaxed),
            average_duration_ns,
            total_duration_ns: total_duration,
            drop_reasons: self.drop_reasons.lock().expect("drop reason lock poisoned").clone(),
            current_parallelism: self.current_parallelism.load(Ordering::Relaxed),
            peak_parallelism: self.peak_parallelism.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter, including the drop-reason histogram — which
    /// is reset to an empty (not absent) map, so a snapshot taken
    /// immediately after never needs a nil check.
    pub fn reset(&self) {
        self.total_builds.store(0, Ordering::Relaxed);
        self.successful_builds.store(0, Ordering::Relaxed);
        self.failed_builds.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.dropped_tasks.store(0, Ordering::Relaxed);
        self.dropped_results.store(0, Ordering::Relaxed);
        self.total_duration_ns.store(0, Ordering::Relaxed);
        self.current_parallelism.store(0, Ordering::Relaxed);
        self.peak_parallelism.store(0, Ordering::Relaxed);
        self.drop_reasons.lock().expect("drop reason lock poisoned").clear();
    }
}

impl Default for MetricsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
