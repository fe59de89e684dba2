//! Expiry Notification
//!
//! Calls notifiers for removed entries. Each call is isolated so a panicking
//! notifier cannot stop the task that runs it.

use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use crate::cache::stats::StatsRecorder;
use crate::cache::{CacheEntry, Notifier};

/// Notifies every expired entry in order, preferring the entry's own notifier.
pub(crate) fn dispatch_expired<K, V>(
    expired: Vec<(K, CacheEntry<K, V>)>,
    fallback: Option<&Notifier<K, V>>,
    stats: &StatsRecorder,
) {
    for (key, entry) in expired {
        notify_one(key, entry, fallback, stats);
    }
}

/// Hands `entry`'s value to its notifier, if there is one.
pub(crate) fn notify_one<K, V>(
    key: K,
    entry: CacheEntry<K, V>,
    fallback: Option<&Notifier<K, V>>,
    stats: &StatsRecorder,
) {
    let Some(notifier) = entry.notifier.as_ref().or(fallback) else {
        return;
    };
    let value = entry.value;
    if panic::catch_unwind(AssertUnwindSafe(|| notifier(key, value))).is_err() {
        stats.record_notifier_panic();
        warn!("Expiry notifier panicked; continuing with remaining entries");
    }
}
