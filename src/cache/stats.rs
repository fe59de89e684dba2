//! Cache Statistics Module
//!
//! Tracks hits, misses, factory loads and expirations.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Point-in-time view of cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups that found a live entry
    pub hits: u64,
    /// Lookups that found nothing (or an entry already past its deadline)
    pub misses: u64,
    /// Successful factory invocations
    pub loads: u64,
    /// Factory invocations that returned an error or a zero TTL
    pub load_failures: u64,
    /// Entries removed because their deadline passed
    pub expirations: u64,
    /// Notifier invocations that panicked
    pub notifier_panics: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Stats Recorder ==
/// Lock-free counters shared between callers and background tasks.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    expirations: AtomicU64,
    notifier_panics: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_notifier_panic(&self) {
        self.notifier_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters, pairing them with the current entry count.
    pub(crate) fn snapshot(&self, total_entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            notifier_panics: self.notifier_panics.load(Ordering::Relaxed),
            total_entries,
        }
    }
}
