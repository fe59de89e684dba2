//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use idle_cache::NewEntry;

/// Installs a test-writer subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "idle_cache=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Records every expiry notification in order.
#[derive(Clone, Default)]
pub struct Expired {
    seen: Arc<Mutex<Vec<(String, u64)>>>,
}

impl Expired {
    pub fn notifier(&self) -> impl Fn(String, u64) + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |key, value| seen.lock().unwrap().push((key, value))
    }

    pub fn all(&self) -> Vec<(String, u64)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count_for(&self, key: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|(k, _)| k == key).count()
    }
}

/// A factory that hands out 1, 2, 3, ... and counts its calls.
#[derive(Clone, Default)]
pub struct Counter {
    calls: Arc<AtomicUsize>,
}

impl Counter {
    pub fn factory(
        &self,
    ) -> impl Fn(&String) -> anyhow::Result<NewEntry<String, u64>> + Send + Sync + 'static {
        let calls = Arc::clone(&self.calls);
        move |_key: &String| {
            let n = calls.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            Ok(NewEntry::new(n))
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn key(name: &str) -> String {
    name.to_string()
}
