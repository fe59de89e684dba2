//! Entry Watcher Task
//!
//! One task per live entry: waits for the entry's deadline or an access
//! signal, and removes the entry once the deadline has really passed.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::timed::map::{Due, TimedShared};

/// Spawns the watcher for entry `id` stored under `key`.
pub(crate) fn spawn_watcher<K, V>(
    shared: &Arc<TimedShared<K, V>>,
    key: K,
    id: u64,
    deadline: Instant,
    signals: mpsc::Receiver<()>,
) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let weak = Arc::downgrade(shared);
    shared
        .runtime
        .spawn(watch(weak, key, id, deadline, signals))
}

async fn watch<K, V>(
    shared: Weak<TimedShared<K, V>>,
    key: K,
    id: u64,
    deadline: Instant,
    mut signals: mpsc::Receiver<()>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let sleep = time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                match shared.expire_if_due(&key, id, Instant::now()) {
                    Due::Expired(entry) => {
                        debug!(entry_id = id, "Timed entry expired");
                        shared.finish_expired(key, entry);
                        return;
                    }
                    // Touched since the timer was armed.
                    Due::NotYet(deadline) => sleep.as_mut().reset(deadline),
                    Due::Gone => return,
                }
            }
            signal = signals.recv() => {
                if signal.is_none() {
                    return;
                }
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                match shared.deadline_of(&key, id) {
                    Some(deadline) => sleep.as_mut().reset(deadline),
                    None => return,
                }
            }
        }
    }
}
