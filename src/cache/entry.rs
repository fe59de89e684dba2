//! Cache Entry Module
//!
//! Defines individual cache entries with idle-timeout metadata.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::options::Notifier;
use crate::error::{CacheError, Result};

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Longest distance a deadline is placed from now, about 30 years.
pub(crate) const MAX_DEADLINE_OFFSET: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + ttl`, saturating at [`MAX_DEADLINE_OFFSET`] instead of overflowing.
pub(crate) fn deadline_after(now: Instant, ttl: Duration) -> Instant {
    let capped = ttl.min(MAX_DEADLINE_OFFSET);
    now.checked_add(capped).unwrap_or(now)
}

// == New Entry ==
/// What a factory (or an explicit insert) hands to the cache.
///
/// A missing TTL falls back to the cache-wide default, a missing notifier to
/// the cache-wide notifier.
pub struct NewEntry<K, V> {
    pub(crate) value: V,
    pub(crate) ttl: Option<Duration>,
    pub(crate) notifier: Option<Notifier<K, V>>,
}

impl<K, V> NewEntry<K, V> {
    /// Wraps a value that uses the cache defaults.
    pub fn new(value: V) -> Self {
        Self {
            value,
            ttl: None,
            notifier: None,
        }
    }

    /// Sets the idle timeout for this entry only.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets a notifier that replaces the cache-wide one for this entry.
    pub fn on_expire<F>(mut self, notifier: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Resolves the effective TTL, rejecting zero.
    pub(crate) fn resolve_ttl(&self, default_ttl: Duration) -> Result<Duration> {
        let ttl = self.ttl.unwrap_or(default_ttl);
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl(ttl));
        }
        Ok(ttl)
    }
}

impl<K, V: fmt::Debug> fmt::Debug for NewEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewEntry")
            .field("value", &self.value)
            .field("ttl", &self.ttl)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

// == Cache Entry ==
/// A live value together with its expiry bookkeeping.
pub struct CacheEntry<K, V> {
    /// Distinguishes this lifetime from later entries under the same key
    pub(crate) id: u64,
    /// The stored value
    pub value: V,
    /// Idle timeout used by touches
    pub ttl: Duration,
    /// Point at which the entry becomes evictable
    pub deadline: Instant,
    /// Per-entry notifier, overrides the cache-wide one
    pub(crate) notifier: Option<Notifier<K, V>>,
}

impl<K, V> CacheEntry<K, V> {
    // == Constructor ==
    /// Creates an entry whose deadline is `now + ttl`. The TTL must already be
    /// resolved and non-zero.
    pub(crate) fn new(new: NewEntry<K, V>, ttl: Duration, now: Instant) -> Self {
        Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            value: new.value,
            ttl,
            deadline: deadline_after(now, ttl),
            notifier: new.notifier,
        }
    }

    // == Is Expired ==
    /// An entry is expired once `now >= deadline`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    // == Touch ==
    /// Pushes the deadline to `now + ttl`, never backwards.
    ///
    /// Returns the deadline in effect afterwards.
    pub(crate) fn touch(&mut self, now: Instant) -> Instant {
        let candidate = deadline_after(now, self.ttl);
        if candidate > self.deadline {
            self.deadline = candidate;
        }
        self.deadline
    }

    // == Reset ==
    /// Replaces the TTL and sets the deadline to `now + ttl`, even if that is
    /// earlier than the current one. A zero TTL makes the entry due now.
    pub(crate) fn reset(&mut self, now: Instant, ttl: Duration) -> Instant {
        self.ttl = ttl;
        self.deadline = deadline_after(now, ttl);
        self.deadline
    }
}

impl<K, V: fmt::Debug> fmt::Debug for CacheEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("value", &self.value)
            .field("ttl", &self.ttl)
            .field("deadline", &self.deadline)
            .finish()
    }
}
