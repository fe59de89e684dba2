//! Cache Store Module
//!
//! Main cache engine: a locked key map paired with a deadline-ordered expiry
//! index, swept by a single background reaper.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::entry::{CacheEntry, NewEntry};
use crate::cache::index::ExpiryIndex;
use crate::cache::loading::{InFlight, LoadRole};
use crate::cache::options::{CacheOptions, Settings};
use crate::cache::stats::{CacheStats, StatsRecorder};
use crate::error::{CacheError, Result};
use crate::tasks::{dispatch_expired, spawn_reaper, Reap, ReaperGuard};

/// Everything guarded by the store lock.
struct StoreState<K, V> {
    entries: HashMap<K, CacheEntry<K, V>>,
    index: ExpiryIndex<K>,
    in_flight: InFlight<K>,
    /// Entries found past their deadline by a caller, waiting for the reaper
    detached: Vec<(K, CacheEntry<K, V>)>,
}

enum Lookup<V> {
    Hit(V),
    Miss,
    /// The entry was past its deadline and has been handed to the reaper
    Detached,
}

impl<K: Eq + Hash + Clone, V: Clone> StoreState<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            index: ExpiryIndex::new(),
            in_flight: InFlight::default(),
            detached: Vec::new(),
        }
    }

    /// Looks up `key` and extends its deadline.
    fn touch(&mut self, key: &K, now: Instant) -> Lookup<V> {
        let expired = match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            self.detach(key);
            return Lookup::Detached;
        }
        let Some(entry) = self.entries.get_mut(key) else {
            return Lookup::Miss;
        };
        let deadline = entry.touch(now);
        let value = entry.value.clone();
        self.index.upsert(key.clone(), deadline);
        Lookup::Hit(value)
    }

    /// Moves an entry from the map and index to the reaper's queue.
    fn detach(&mut self, key: &K) {
        if let Some(entry) = self.entries.remove(key) {
            self.index.remove(key);
            self.detached.push((key.clone(), entry));
        }
    }

    /// Inserts `entry`, keeping map and index in step.
    ///
    /// Returns a replaced live entry, and whether the reaper must recompute
    /// its wake time. A replaced entry that had already timed out is queued
    /// for the reaper instead, since it still owes its notification.
    fn insert(
        &mut self,
        key: K,
        entry: CacheEntry<K, V>,
        now: Instant,
    ) -> (Option<CacheEntry<K, V>>, bool) {
        let earliest = self.index.peek_earliest_deadline();
        let wake = earliest.map_or(true, |earliest| entry.deadline < earliest);
        self.index.upsert(key.clone(), entry.deadline);
        match self.entries.insert(key.clone(), entry) {
            Some(previous) if previous.is_expired(now) => {
                self.detached.push((key, previous));
                (None, true)
            }
            // Anything detached by an earlier touch also needs the reaper.
            previous => (previous, wake || !self.detached.is_empty()),
        }
    }

    /// Restarts a live entry's countdown with `ttl`. Returns false if `key` is not live.
    fn reset(&mut self, key: &K, now: Instant, ttl: Duration) -> bool {
        let expired = match self.entries.get(key) {
            None => return false,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            self.detach(key);
            return false;
        }
        if let Some(entry) = self.entries.get_mut(key) {
            let deadline = entry.reset(now, ttl);
            self.index.upsert(key.clone(), deadline);
        }
        true
    }

    /// Removes a live entry. A stale one goes to the reaper instead.
    fn remove(&mut self, key: &K, now: Instant) -> Lookup<V> {
        let expired = match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            self.detach(key);
            return Lookup::Detached;
        }
        self.index.remove(key);
        match self.entries.remove(key) {
            Some(entry) => Lookup::Hit(entry.value),
            None => Lookup::Miss,
        }
    }

    fn live(&self, key: &K, now: Instant) -> Option<&CacheEntry<K, V>> {
        self.entries.get(key).filter(|entry| !entry.is_expired(now))
    }
}

/// State shared between cache handles and the reaper.
struct Shared<K, V> {
    state: RwLock<StoreState<K, V>>,
    settings: Settings<K, V>,
    stats: StatsRecorder,
    wake: Arc<Notify>,
}

impl<K, V> Reap for Shared<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn reap(&self, now: Instant) -> Option<Instant> {
        let (expired, next) = {
            let mut state = self.state.write();
            let mut expired = std::mem::take(&mut state.detached);
            for key in state.index.pop_all_due_by(now) {
                if let Some(entry) = state.entries.remove(&key) {
                    expired.push((key, entry));
                }
            }
            (expired, state.index.peek_earliest_deadline())
        };

        if !expired.is_empty() {
            debug!(removed = expired.len(), "Swept expired entries");
            self.stats.record_expirations(expired.len());
            dispatch_expired(expired, self.settings.notifier.as_ref(), &self.stats);
        }
        next
    }

    fn wake_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn idle_interval(&self) -> Duration {
        self.settings.idle_interval
    }
}

/// Clears the in-flight marker for a key even if the factory panics.
struct LoadGuard<'a, K: Eq + Hash + Clone, V> {
    shared: &'a Shared<K, V>,
    key: K,
}

impl<K: Eq + Hash + Clone, V> Drop for LoadGuard<'_, K, V> {
    fn drop(&mut self) {
        self.shared.state.write().in_flight.release(&self.key);
    }
}

// == Expire Cache ==
/// Concurrent map whose entries expire after an idle timeout.
///
/// Deadlines live in a shared [`ExpiryIndex`]; one background task sleeps
/// until the earliest deadline, removes everything due and then calls the
/// expiry notifiers outside the store lock. Touches cost `O(log n)` and the
/// cache runs a single task regardless of its size.
///
/// Cloning the handle is cheap. The reaper stops when the last clone is dropped.
pub struct ExpireCache<K, V> {
    shared: Arc<Shared<K, V>>,
    _reaper: Arc<ReaperGuard>,
}

impl<K, V> Clone for ExpireCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _reaper: Arc::clone(&self._reaper),
        }
    }
}

impl<K, V> ExpireCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Constructor ==
    /// Builds a cache with default options and the given idle timeout.
    pub fn new(default_ttl: Duration) -> Result<Self> {
        CacheOptions::new().default_ttl(default_ttl).build()
    }

    /// Builds a cache from options; see [`CacheOptions::build`].
    pub fn with_options(options: CacheOptions<K, V>) -> Result<Self> {
        // Plain `load` does not touch unless asked to.
        let settings = options.into_settings(false)?;
        let runtime = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;

        let shared = Arc::new(Shared {
            state: RwLock::new(StoreState::new()),
            settings,
            stats: StatsRecorder::default(),
            wake: Arc::new(Notify::new()),
        });
        let reaper = spawn_reaper(&runtime, &shared);

        Ok(Self {
            shared,
            _reaper: Arc::new(reaper),
        })
    }

    // == Load ==
    /// Returns the value for `key` if it is live.
    ///
    /// Extends the deadline only when the cache was built with `touch_on_load(true)`.
    pub fn load(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let value = if self.shared.settings.touch_on_load {
            let lookup = self.shared.state.write().touch(key, now);
            match lookup {
                Lookup::Hit(value) => Some(value),
                Lookup::Miss => None,
                Lookup::Detached => {
                    self.shared.wake.notify_one();
                    None
                }
            }
        } else {
            let state = self.shared.state.read();
            state.live(key, now).map(|entry| entry.value.clone())
        };

        match value {
            Some(_) => self.shared.stats.record_hit(),
            None => self.shared.stats.record_miss(),
        }
        value
    }

    // == Load Or New ==
    /// Returns the live value for `key`, creating it with the default factory on a miss.
    ///
    /// The boolean is `true` when the value was already present.
    pub fn load_or_new(&self, key: K) -> Result<(V, bool)> {
        let factory = self
            .shared
            .settings
            .factory
            .clone()
            .ok_or(CacheError::MissingFactory)?;
        self.load_or_insert_with(key, |key| factory(key))
    }

    /// Like [`ExpireCache::load_or_new`] with a factory for this call only.
    pub fn load_or_new_with<F>(&self, key: K, factory: F) -> Result<(V, bool)>
    where
        F: FnOnce(&K) -> anyhow::Result<NewEntry<K, V>>,
    {
        self.load_or_insert_with(key, factory)
    }

    fn load_or_insert_with<F>(&self, key: K, factory: F) -> Result<(V, bool)>
    where
        F: FnOnce(&K) -> anyhow::Result<NewEntry<K, V>>,
    {
        let shared = &*self.shared;
        loop {
            let mut state = shared.state.write();
            match state.touch(&key, Instant::now()) {
                Lookup::Hit(value) => {
                    shared.stats.record_hit();
                    return Ok((value, true));
                }
                Lookup::Detached => shared.wake.notify_one(),
                Lookup::Miss => {}
            }
            match state.in_flight.claim(&key) {
                LoadRole::Loader => break,
                LoadRole::Waiter(gate) => {
                    drop(state);
                    gate.wait();
                }
            }
        }

        shared.stats.record_miss();
        let guard = LoadGuard {
            shared,
            key: key.clone(),
        };

        let fresh = factory(&key).map_err(|err| {
            shared.stats.record_load_failure();
            debug!(error = %err, "Value factory failed, nothing inserted");
            CacheError::Factory(err)
        })?;
        let ttl = fresh.resolve_ttl(shared.settings.default_ttl).map_err(|err| {
            shared.stats.record_load_failure();
            err
        })?;
        shared.stats.record_load();

        let now = Instant::now();
        let (value, present, replaced, wake) = {
            let mut state = shared.state.write();
            // An explicit insert may have landed while the factory ran; it wins.
            if let Lookup::Hit(value) = state.touch(&key, now) {
                (value, true, None, false)
            } else {
                let value = fresh.value.clone();
                let (replaced, wake) = state.insert(key, CacheEntry::new(fresh, ttl, now), now);
                (value, false, replaced, wake)
            }
        };
        drop(guard);
        drop(replaced);

        if wake {
            shared.wake.notify_one();
        }
        if !present {
            debug!(ttl_ms = ttl.as_millis() as u64, "Cache entry created");
        }
        Ok((value, present))
    }

    // == Insert ==
    /// Stores `value` under `key` with the cache-wide TTL and notifier.
    ///
    /// A replaced value is dropped without notification.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.insert_entry(key, NewEntry::new(value))
    }

    /// Stores an entry with its own TTL and/or notifier.
    pub fn insert_entry(&self, key: K, fresh: NewEntry<K, V>) -> Result<()> {
        let ttl = fresh.resolve_ttl(self.shared.settings.default_ttl)?;
        let now = Instant::now();
        let entry = CacheEntry::new(fresh, ttl, now);
        let (replaced, wake) = self.shared.state.write().insert(key, entry, now);
        drop(replaced);

        if wake {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    // == Reset Expiration ==
    /// Replaces the TTL of a live entry and restarts its countdown from now.
    ///
    /// Unlike a touch this may move the deadline backwards; `Duration::ZERO`
    /// makes the entry due immediately and the reaper removes it. Returns
    /// `false`, inserting nothing, when `key` is not live.
    pub fn reset_expiration(&self, key: &K, ttl: Duration) -> bool {
        let updated = self.shared.state.write().reset(key, Instant::now(), ttl);
        self.shared.wake.notify_one();
        updated
    }

    // == Remove ==
    /// Deletes `key` without notifying. Returns the value if it was live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.shared.state.write().remove(key, Instant::now());
        match removed {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss => None,
            Lookup::Detached => {
                self.shared.wake.notify_one();
                None
            }
        }
    }

    // == Inspection ==
    /// Current deadline of a live entry.
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        let state = self.shared.state.read();
        state.live(key, Instant::now()).map(|entry| entry.deadline)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.state.read().live(key, Instant::now()).is_some()
    }

    /// Number of stored entries, including ones past their deadline that the
    /// reaper has not removed yet.
    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot(self.len())
    }
}

#[cfg(test)]
impl<K: Eq + Hash + Clone, V> ExpireCache<K, V> {
    /// Each stored key with its entry deadline and its index position, plus
    /// the index size.
    pub(crate) fn index_snapshot(&self) -> (Vec<(K, Instant, Option<Instant>)>, usize) {
        let state = self.shared.state.read();
        let rows = state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.deadline, state.index.deadline_of(key)))
            .collect();
        (rows, state.index.len())
    }
}

impl<K, V> fmt::Debug for ExpireCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("ExpireCache")
            .field("entries", &state.entries.len())
            .field("default_ttl", &self.shared.settings.default_ttl)
            .field("touch_on_load", &self.shared.settings.touch_on_load)
            .finish()
    }
}
