//! Expiry Reaper Task
//!
//! Background task that removes expired entries as their deadlines pass.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::cache::deadline_after;

/// A store the reaper can sweep.
pub(crate) trait Reap: Send + Sync + 'static {
    /// Removes everything due by `now`, notifies it, and returns the next
    /// deadline still pending.
    fn reap(&self, now: Instant) -> Option<Instant>;

    /// Signal that makes the reaper recompute its wake time.
    fn wake_signal(&self) -> Arc<Notify>;

    /// Sleep used when nothing is pending.
    fn idle_interval(&self) -> Duration;
}

/// Aborts the reaper when dropped.
#[derive(Debug)]
pub(crate) struct ReaperGuard {
    handle: JoinHandle<()>,
}

impl ReaperGuard {
    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ReaperGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns the reaper for `store` on `runtime`.
///
/// The task sleeps until the earliest pending deadline or until the store's
/// wake signal fires, sweeps, and repeats. It keeps only a weak reference,
/// so it also ends on its own once the store is gone.
pub(crate) fn spawn_reaper<R: Reap>(runtime: &Handle, store: &Arc<R>) -> ReaperGuard {
    let weak: Weak<R> = Arc::downgrade(store);
    let wake = store.wake_signal();
    let idle = store.idle_interval();

    let handle = runtime.spawn(async move {
        info!(
            idle_interval_ms = idle.as_millis() as u64,
            "Starting expiry reaper"
        );

        loop {
            let Some(store) = weak.upgrade() else {
                break;
            };
            let now = Instant::now();
            let next = store.reap(now);
            drop(store);

            let wake_at = match next {
                Some(deadline) => {
                    debug!(
                        in_ms = deadline.saturating_duration_since(now).as_millis() as u64,
                        "Reaper armed for next deadline"
                    );
                    deadline
                }
                None => deadline_after(now, idle),
            };

            tokio::select! {
                _ = time::sleep_until(wake_at) => {}
                _ = wake.notified() => {}
            }
        }

        info!("Expiry reaper stopped");
    });

    ReaperGuard { handle }
}
