//! Timed Map Module
//!
//! Idle cache where each entry is expired by its own watcher task.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::stats::StatsRecorder;
use crate::cache::{
    CacheEntry, CacheOptions, CacheStats, InFlight, LoadRole, NewEntry, Settings,
};
use crate::error::{CacheError, Result};
use crate::tasks::notify_one;
use crate::timed::watcher::spawn_watcher;

/// A live entry plus the handles of its watcher.
struct Slot<K, V> {
    entry: CacheEntry<K, V>,
    /// Depth-1 access channel; a full channel already guarantees a re-read
    signal: mpsc::Sender<()>,
    watcher: JoinHandle<()>,
}

impl<K, V> Slot<K, V> {
    fn nudge(&self) {
        let _ = self.signal.try_send(());
    }
}

struct TimedState<K, V> {
    slots: HashMap<K, Slot<K, V>>,
    in_flight: InFlight<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> TimedState<K, V> {
    /// Extends a live entry's deadline and wakes its watcher.
    ///
    /// An entry past its deadline is left for its watcher to remove.
    fn touch(&mut self, key: &K, now: Instant) -> Option<V> {
        let slot = self.slots.get_mut(key)?;
        if slot.entry.is_expired(now) {
            return None;
        }
        slot.entry.touch(now);
        slot.nudge();
        Some(slot.entry.value.clone())
    }
}

impl<K, V> Drop for TimedState<K, V> {
    fn drop(&mut self) {
        for slot in self.slots.values() {
            slot.watcher.abort();
        }
    }
}

/// What a watcher finds when its timer fires.
pub(crate) enum Due<K, V> {
    /// Removed from the map; the caller owns the notification
    Expired(CacheEntry<K, V>),
    /// The deadline moved; re-arm for it
    NotYet(Instant),
    /// The entry was removed or replaced by someone else
    Gone,
}

pub(crate) struct TimedShared<K, V> {
    state: RwLock<TimedState<K, V>>,
    settings: Settings<K, V>,
    stats: StatsRecorder,
    pub(crate) runtime: Handle,
}

impl<K, V> TimedShared<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Removes entry `id` under `key` if its deadline has passed.
    pub(crate) fn expire_if_due(&self, key: &K, id: u64, now: Instant) -> Due<K, V> {
        let mut state = self.state.write();
        match state.slots.get(key) {
            Some(slot) if slot.entry.id == id => {
                if !slot.entry.is_expired(now) {
                    return Due::NotYet(slot.entry.deadline);
                }
            }
            _ => return Due::Gone,
        }
        match state.slots.remove(key) {
            Some(slot) => Due::Expired(slot.entry),
            None => Due::Gone,
        }
    }

    /// Current deadline of entry `id` under `key`.
    pub(crate) fn deadline_of(&self, key: &K, id: u64) -> Option<Instant> {
        let state = self.state.read();
        state
            .slots
            .get(key)
            .filter(|slot| slot.entry.id == id)
            .map(|slot| slot.entry.deadline)
    }

    /// Records and notifies an entry that has left the map.
    pub(crate) fn finish_expired(&self, key: K, entry: CacheEntry<K, V>) {
        self.stats.record_expirations(1);
        notify_one(key, entry, self.settings.notifier.as_ref(), &self.stats);
    }
}

/// Clears the in-flight marker for a key even if the factory panics.
struct LoadGuard<'a, K: Eq + Hash + Clone, V> {
    shared: &'a TimedShared<K, V>,
    key: K,
}

impl<K: Eq + Hash + Clone, V> Drop for LoadGuard<'_, K, V> {
    fn drop(&mut self) {
        self.shared.state.write().in_flight.release(&self.key);
    }
}

// == Timed Map ==
/// Concurrent map whose entries expire after an idle timeout, one timer per entry.
///
/// A touch is `O(1)`: it moves the entry's deadline and drops a signal into
/// the watcher's one-slot channel. The price is one task and one timer per
/// live key; [`ExpireCache`](crate::ExpireCache) runs a single task instead.
///
/// Plain `load` counts as a touch unless built with `touch_on_load(false)`.
pub struct TimedMap<K, V> {
    shared: Arc<TimedShared<K, V>>,
}

impl<K, V> Clone for TimedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> TimedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    // == Constructor ==
    /// Builds a map with default options and the given idle timeout.
    pub fn new(default_ttl: Duration) -> Result<Self> {
        CacheOptions::new().default_ttl(default_ttl).build_timed()
    }

    /// Builds a map from options; see [`CacheOptions::build_timed`].
    pub fn with_options(options: CacheOptions<K, V>) -> Result<Self> {
        let settings = options.into_settings(true)?;
        let runtime = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
        Ok(Self {
            shared: Arc::new(TimedShared {
                state: RwLock::new(TimedState {
                    slots: HashMap::new(),
                    in_flight: InFlight::default(),
                }),
                settings,
                stats: StatsRecorder::default(),
                runtime,
            }),
        })
    }

    // == Load ==
    /// Returns the value for `key` if it is live, touching it when
    /// `touch_on_load` is on.
    pub fn load(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let value = if self.shared.settings.touch_on_load {
            self.shared.state.write().touch(key, now)
        } else {
            let state = self.shared.state.read();
            state
                .slots
                .get(key)
                .filter(|slot| !slot.entry.is_expired(now))
                .map(|slot| slot.entry.value.clone())
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

    /// Like [`TimedMap::load_or_new`] with a factory for this call only.
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
            if let Some(value) = state.touch(&key, Instant::now()) {
                shared.stats.record_hit();
                return Ok((value, true));
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
        let (value, present, stale) = {
            let mut state = shared.state.write();
            // An explicit insert may have landed while the factory ran; it wins.
            match state.touch(&key, now) {
                Some(value) => (value, true, None),
                None => {
                    let value = fresh.value.clone();
                    let stale = self.store(&mut state, key, CacheEntry::new(fresh, ttl, now));
                    (value, false, stale)
                }
            }
        };
        drop(guard);

        if let Some((key, entry)) = stale {
            self.retire(key, entry);
        }
        if !present {
            debug!(ttl_ms = ttl.as_millis() as u64, "Timed entry created");
        }
        Ok((value, present))
    }

    /// Puts `entry` in the map with a fresh watcher and stops the previous one.
    ///
    /// Returns the previous entry if it had already timed out; it still owes
    /// its notification.
    fn store(
        &self,
        state: &mut TimedState<K, V>,
        key: K,
        entry: CacheEntry<K, V>,
    ) -> Option<(K, CacheEntry<K, V>)> {
        let now = Instant::now();
        let (signal, signals) = mpsc::channel(1);
        let watcher = spawn_watcher(&self.shared, key.clone(), entry.id, entry.deadline, signals);
        let slot = Slot {
            entry,
            signal,
            watcher,
        };

        let previous = state.slots.insert(key.clone(), slot)?;
        previous.watcher.abort();
        previous
            .entry
            .is_expired(now)
            .then(|| (key, previous.entry))
    }

    /// Notifies an entry taken out of the map on a background task.
    fn retire(&self, key: K, entry: CacheEntry<K, V>) {
        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn(async move {
            shared.finish_expired(key, entry);
        });
    }

    // == Insert ==
    /// Stores `value` under `key` with the cache-wide TTL and notifier.
    ///
    /// A replaced live value is dropped without notification.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.insert_entry(key, NewEntry::new(value))
    }

    /// Stores an entry with its own TTL and/or notifier.
    pub fn insert_entry(&self, key: K, fresh: NewEntry<K, V>) -> Result<()> {
        let ttl = fresh.resolve_ttl(self.shared.settings.default_ttl)?;
        let entry = CacheEntry::new(fresh, ttl, Instant::now());
        let stale = {
            let mut state = self.shared.state.write();
            self.store(&mut state, key, entry)
        };
        if let Some((key, entry)) = stale {
            self.retire(key, entry);
        }
        Ok(())
    }

    // == Reset Expiration ==
    /// Replaces the TTL of a live entry and restarts its countdown from now.
    ///
    /// `Duration::ZERO` makes the entry due immediately; its watcher removes
    /// it. Returns `false`, inserting nothing, when `key` is not live.
    pub fn reset_expiration(&self, key: &K, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut state = self.shared.state.write();
        let Some(slot) = state.slots.get_mut(key) else {
            return false;
        };
        if slot.entry.is_expired(now) {
            return false;
        }
        slot.entry.reset(now, ttl);
        slot.nudge();
        true
    }

    // == Remove ==
    /// Deletes `key` without notifying. Returns the value if it was live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut state = self.shared.state.write();
        if state.slots.get(key)?.entry.is_expired(now) {
            // Its watcher is about to expire it and notify.
            return None;
        }
        let slot = state.slots.remove(key)?;
        slot.watcher.abort();
        Some(slot.entry.value)
    }

    // == Inspection ==
    /// Current deadline of a live entry.
    pub fn deadline(&self, key: &K) -> Option<Instant> {
        let now = Instant::now();
        let state = self.shared.state.read();
        state
            .slots
            .get(key)
            .filter(|slot| !slot.entry.is_expired(now))
            .map(|slot| slot.entry.deadline)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.deadline(key).is_some()
    }

    /// Number of stored entries, including ones whose watcher has not run yet.
    pub fn len(&self) -> usize {
        self.shared.state.read().slots.len()
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

impl<K, V> fmt::Debug for TimedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("TimedMap")
            .field("entries", &state.slots.len())
            .field("default_ttl", &self.shared.settings.default_ttl)
            .field("touch_on_load", &self.shared.settings.touch_on_load)
            .finish()
    }
}
