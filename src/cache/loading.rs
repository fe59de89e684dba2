//! In-flight Load Tracking
//!
//! Lets one caller run the factory for a key while concurrent callers for the
//! same key wait, without holding the store lock during the factory call.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// One pending factory call.
#[derive(Debug, Default)]
pub(crate) struct LoadGate {
    done: Mutex<bool>,
    finished: Condvar,
}

impl LoadGate {
    /// Blocks until the loader calls [`LoadGate::open`].
    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.finished.wait(&mut done);
        }
    }

    fn open(&self) {
        *self.done.lock() = true;
        self.finished.notify_all();
    }
}

/// Either the caller owns the load or someone else does.
pub(crate) enum LoadRole {
    Loader,
    Waiter(Arc<LoadGate>),
}

/// Keys whose factory is currently running.
#[derive(Debug)]
pub(crate) struct InFlight<K> {
    gates: HashMap<K, Arc<LoadGate>>,
}

impl<K> Default for InFlight<K> {
    fn default() -> Self {
        Self {
            gates: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> InFlight<K> {
    /// Registers the caller as loader for `key`, or hands back the gate to wait on.
    pub(crate) fn claim(&mut self, key: &K) -> LoadRole {
        match self.gates.get(key) {
            Some(gate) => LoadRole::Waiter(Arc::clone(gate)),
            None => {
                self.gates.insert(key.clone(), Arc::new(LoadGate::default()));
                LoadRole::Loader
            }
        }
    }

    /// Ends the load for `key` and wakes everyone waiting on it.
    pub(crate) fn release(&mut self, key: &K) {
        if let Some(gate) = self.gates.remove(key) {
            gate.open();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.gates.len()
    }
}
