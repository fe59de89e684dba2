//! Expiry Index Module
//!
//! Orders live keys by deadline so the reaper can find what expires next
//! without scanning the whole store.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use tokio::time::Instant;

// == Expiry Index ==
/// Deadline-ordered index of keys.
///
/// Keys sharing a deadline live in the same bucket, kept in insertion order.
/// A reverse map records each key's current deadline so a key occupies at
/// most one bucket.
#[derive(Debug)]
pub struct ExpiryIndex<K> {
    /// Deadline -> keys due at that instant
    buckets: BTreeMap<Instant, Vec<K>>,
    /// Key -> the bucket it currently sits in
    positions: HashMap<K, Instant>,
}

impl<K> Default for ExpiryIndex<K> {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
            positions: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> ExpiryIndex<K> {
    // == Constructor ==
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    // == Upsert ==
    /// Places `key` at `deadline`, moving it out of its previous bucket.
    pub fn upsert(&mut self, key: K, deadline: Instant) {
        if let Some(previous) = self.positions.get(&key).copied() {
            if previous == deadline {
                return;
            }
            self.detach(&key, previous);
        }
        self.buckets.entry(deadline).or_default().push(key.clone());
        self.positions.insert(key, deadline);
    }

    // == Remove ==
    /// Drops `key` from the index. Returns its deadline if it was present.
    pub fn remove(&mut self, key: &K) -> Option<Instant> {
        let deadline = self.positions.remove(key)?;
        self.detach(key, deadline);
        Some(deadline)
    }

    // == Pop All Due ==
    /// Removes and returns every key with `deadline <= now`, oldest first.
    pub fn pop_all_due_by(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        while let Some(entry) = self.buckets.first_entry() {
            if *entry.key() > now {
                break;
            }
            for key in entry.remove() {
                self.positions.remove(&key);
                due.push(key);
            }
        }
        due
    }

    // == Peek ==
    /// The earliest deadline in the index, if any.
    pub fn peek_earliest_deadline(&self) -> Option<Instant> {
        self.buckets.keys().next().copied()
    }

    /// Deadline currently recorded for `key`.
    pub fn deadline_of(&self, key: &K) -> Option<Instant> {
        self.positions.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Number of distinct deadlines.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn detach(&mut self, key: &K, deadline: Instant) {
        if let Some(bucket) = self.buckets.get_mut(&deadline) {
            if let Some(pos) = bucket.iter().position(|k| k == key) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                self.buckets.remove(&deadline);
            }
        }
    }
}
