//! Integration Tests for the indexed cache
//!
//! Drives `ExpireCache` through simulated time and checks eviction timing,
//! notification counts and factory behaviour.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use idle_cache::{CacheError, CacheOptions, ExpireCache, NewEntry};
use tokio::runtime::Handle;
use tokio::time::{self, Instant};
use tokio_test::{assert_err, assert_ok};

use common::{init_tracing, key, Counter, Expired};

const TTL: Duration = Duration::from_millis(100);

// == Helper Functions ==

fn cache_with(counter: &Counter, expired: &Expired) -> ExpireCache<String, u64> {
    init_tracing();
    CacheOptions::new()
        .default_ttl(TTL)
        .factory(counter.factory())
        .notifier(expired.notifier())
        .build()
        .unwrap()
}

// == Load Or New ==

#[tokio::test(start_paused = true)]
async fn test_load_or_new_then_idle_expiry() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);

    let (value, present) = cache.load_or_new(key("a")).unwrap();
    assert_eq!((value, present), (1, false));
    assert_eq!(counter.calls(), 1);

    let (again, present) = cache.load_or_new(key("a")).unwrap();
    assert_eq!((again, present), (1, true));
    assert_eq!(counter.calls(), 1);

    time::sleep(Duration::from_millis(150)).await;

    assert_eq!(cache.load(&key("a")), None);
    assert_eq!(expired.all(), vec![(key("a"), 1)]);
}

#[tokio::test(start_paused = true)]
async fn test_reinsert_after_expiry_is_a_new_lifetime() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);

    cache.load_or_new(key("a")).unwrap();
    time::sleep(Duration::from_millis(150)).await;

    let (value, present) = cache.load_or_new(key("a")).unwrap();
    assert_eq!((value, present), (2, false));
    assert_eq!(counter.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_factory_error_propagates() {
    let cache: ExpireCache<String, u64> = ExpireCache::new(TTL).unwrap();

    let err = assert_err!(cache.load_or_new_with(key("a"), |_| anyhow::bail!("no backend")));
    assert!(matches!(err, CacheError::Factory(_)));
    assert!(!err.is_config_error());
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_factory_may_reenter_for_other_keys() {
    let cache: ExpireCache<String, u64> = ExpireCache::new(TTL).unwrap();

    let (value, _) = cache
        .load_or_new_with(key("outer"), |_| {
            let (inner, _) = cache.load_or_new_with(key("inner"), |_| Ok(NewEntry::new(5)))?;
            Ok(NewEntry::new(inner * 2))
        })
        .unwrap();

    assert_eq!(value, 10);
    assert_eq!(cache.load(&key("inner")), Some(5));
    assert_eq!(cache.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_misses_call_factory_once() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = CacheOptions::new()
        .default_ttl(Duration::from_secs(5))
        .factory({
            let factory = counter.factory();
            move |key: &String| {
                thread::sleep(Duration::from_millis(20));
                factory(key)
            }
        })
        .notifier(expired.notifier())
        .build()
        .unwrap();

    let results: Vec<(u64, bool)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| cache.load_or_new(key("shared")).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(counter.calls(), 1);
    assert!(results.iter().all(|(value, _)| *value == 1));
    assert_eq!(results.iter().filter(|(_, present)| !present).count(), 1);
}

// == Touching ==

#[tokio::test(start_paused = true)]
async fn test_no_premature_eviction_while_touched() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);

    cache.load_or_new(key("a")).unwrap();
    for _ in 0..20 {
        time::sleep(Duration::from_millis(60)).await;
        let (_, present) = cache.load_or_new(key("a")).unwrap();
        assert!(present);
    }

    assert_eq!(counter.calls(), 1);
    assert!(expired.all().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_plain_load_does_not_keep_entry_alive() {
    let expired = Expired::default();
    let cache = CacheOptions::new()
        .default_ttl(TTL)
        .notifier(expired.notifier())
        .build()
        .unwrap();
    cache.insert(key("a"), 7).unwrap();

    time::sleep(Duration::from_millis(60)).await;
    assert_eq!(cache.load(&key("a")), Some(7));
    time::sleep(Duration::from_millis(60)).await;

    assert_eq!(cache.load(&key("a")), None);
    assert_eq!(expired.count_for("a"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_touch_on_load_keeps_entry_alive() {
    let cache = CacheOptions::new()
        .default_ttl(TTL)
        .touch_on_load(true)
        .build()
        .unwrap();
    cache.insert(key("a"), 7u64).unwrap();

    for _ in 0..5 {
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.load(&key("a")), Some(7));
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadlines_never_move_backwards_on_touch() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);

    cache.load_or_new(key("a")).unwrap();
    let mut last = cache.deadline(&key("a")).unwrap();
    for step in [10, 0, 30, 0, 5] {
        time::advance(Duration::from_millis(step)).await;
        cache.load_or_new(key("a")).unwrap();
        let deadline = cache.deadline(&key("a")).unwrap();
        assert!(deadline >= last);
        last = deadline;
    }

    // An explicit reset is allowed to shorten it.
    assert!(cache.reset_expiration(&key("a"), Duration::from_millis(10)));
    assert!(cache.deadline(&key("a")).unwrap() < last);
}

// == Expiry ==

#[tokio::test(start_paused = true)]
async fn test_eventual_eviction_notifies_once() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);

    cache.insert(key("a"), 42).unwrap();
    time::sleep(TTL + Duration::from_millis(1)).await;
    assert_eq!(expired.all(), vec![(key("a"), 42)]);

    time::sleep(TTL * 5).await;
    assert_eq!(expired.count_for("a"), 1);
    assert_eq!(cache.stats().expirations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_tied_deadlines_all_evicted() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);

    // The clock is paused, so every entry gets the same deadline.
    for i in 0..50 {
        cache.insert(format!("k{i}"), i).unwrap();
    }
    let first = cache.deadline(&key("k0")).unwrap();
    assert_eq!(cache.deadline(&key("k49")), Some(first));

    time::sleep(TTL + Duration::from_millis(1)).await;

    let mut values: Vec<u64> = expired.all().into_iter().map(|(_, v)| v).collect();
    values.sort();
    assert_eq!(values, (0..50).collect::<Vec<_>>());
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_per_entry_ttl_and_notifier() {
    let expired = Expired::default();
    let own = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&own);
    let cache = CacheOptions::new()
        .default_ttl(Duration::from_secs(10))
        .notifier(expired.notifier())
        .build()
        .unwrap();

    cache
        .insert_entry(
            key("short"),
            NewEntry::new(1)
                .with_ttl(Duration::from_millis(30))
                .on_expire(move |key, value| sink.lock().unwrap().push((key, value))),
        )
        .unwrap();
    cache.insert(key("long"), 2).unwrap();

    time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*own.lock().unwrap(), vec![(key("short"), 1)]);
    assert!(expired.all().is_empty());
    assert!(cache.contains_key(&key("long")));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_notifier_does_not_stop_reaper() {
    let expired = Expired::default();
    let cache = CacheOptions::new()
        .default_ttl(TTL)
        .notifier(expired.notifier())
        .build()
        .unwrap();

    cache
        .insert_entry(
            key("bad"),
            NewEntry::new(0).on_expire(|_, _| panic!("notifier blew up")),
        )
        .unwrap();
    cache.insert(key("good"), 1).unwrap();
    time::sleep(TTL + Duration::from_millis(1)).await;

    assert_eq!(expired.all(), vec![(key("good"), 1)]);
    assert_eq!(cache.stats().notifier_panics, 1);

    // The reaper is still running.
    cache.insert(key("later"), 2).unwrap();
    time::sleep(TTL + Duration::from_millis(1)).await;
    assert_eq!(expired.count_for("later"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_notifier_may_reenter_cache() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let slot: Arc<Mutex<Option<ExpireCache<String, u64>>>> = Arc::new(Mutex::new(None));
    let cache = CacheOptions::new()
        .default_ttl(TTL)
        .notifier({
            let slot = Arc::clone(&slot);
            let seen = Arc::clone(&seen);
            move |key: String, _value: u64| {
                if let Some(cache) = slot.lock().unwrap().as_ref() {
                    seen.lock().unwrap().push((cache.contains_key(&key), cache.len()));
                }
            }
        })
        .build()
        .unwrap();
    *slot.lock().unwrap() = Some(cache.clone());

    cache.insert(key("a"), 1).unwrap();
    time::sleep(TTL + Duration::from_millis(1)).await;

    // The entry is already gone when its notifier runs.
    assert_eq!(*seen.lock().unwrap(), vec![(false, 0)]);
    slot.lock().unwrap().take();
}

// == Reset Expiration ==

#[tokio::test(start_paused = true)]
async fn test_reset_expiration_missing_key() {
    let cache: ExpireCache<String, u64> = ExpireCache::new(TTL).unwrap();
    assert!(!cache.reset_expiration(&key("missing-key"), Duration::from_secs(1)));
    assert!(!cache.contains_key(&key("missing-key")));
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reset_to_zero_expires_through_reaper() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);

    cache.insert(key("a"), 3).unwrap();
    assert!(cache.reset_expiration(&key("a"), Duration::ZERO));
    assert_eq!(cache.load(&key("a")), None);

    time::sleep(Duration::from_millis(1)).await;
    assert_eq!(expired.all(), vec![(key("a"), 3)]);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reset_extends_past_default() {
    let expired = Expired::default();
    let cache = CacheOptions::new()
        .default_ttl(TTL)
        .notifier(expired.notifier())
        .build()
        .unwrap();

    cache.insert(key("a"), 1).unwrap();
    assert!(cache.reset_expiration(&key("a"), Duration::from_millis(500)));

    time::sleep(Duration::from_millis(300)).await;
    assert!(cache.contains_key(&key("a")));
    time::sleep(Duration::from_millis(201)).await;
    assert_eq!(expired.count_for("a"), 1);
}

// == Insert ==

#[tokio::test(start_paused = true)]
async fn test_replaced_value_is_not_notified() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);

    cache.insert(key("a"), 1).unwrap();
    cache.insert(key("a"), 2).unwrap();
    assert_eq!(cache.len(), 1);

    time::sleep(TTL + Duration::from_millis(1)).await;
    assert_eq!(expired.all(), vec![(key("a"), 2)]);
}

// == Construction ==

#[tokio::test(start_paused = true)]
async fn test_zero_ttl_construction_fails_without_tasks() {
    let metrics = Handle::current().metrics();
    let before = metrics.num_alive_tasks();

    let result: idle_cache::Result<ExpireCache<String, u64>> = ExpireCache::new(Duration::ZERO);
    let err = assert_err!(result);
    assert!(matches!(err, CacheError::InvalidTtl(_)));
    assert!(err.is_config_error());
    assert_eq!(metrics.num_alive_tasks(), before);

    let cache: ExpireCache<String, u64> = assert_ok!(ExpireCache::new(TTL));
    assert_eq!(metrics.num_alive_tasks(), before + 1);
    drop(cache);
}

#[tokio::test(start_paused = true)]
async fn test_default_factory() {
    let cache: ExpireCache<String, u64> = CacheOptions::new()
        .default_ttl(TTL)
        .default_factory()
        .build()
        .unwrap();

    assert_eq!(cache.load_or_new(key("a")).unwrap(), (0, false));
    assert_eq!(cache.stats().loads, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stats_reflect_activity() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);
    let start = Instant::now();

    cache.load_or_new(key("a")).unwrap();
    cache.load_or_new(key("a")).unwrap();
    assert_eq!(cache.load(&key("missing")), None);
    time::sleep_until(start + TTL * 2).await;

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.expirations, 1);
    assert_eq!(stats.total_entries, 0);
}

// == Extreme Durations ==

#[tokio::test(start_paused = true)]
async fn test_huge_idle_interval_still_evicts() {
    let expired = Expired::default();
    let cache = CacheOptions::new()
        .default_ttl(TTL)
        .idle_interval(Duration::MAX)
        .notifier(expired.notifier())
        .build()
        .unwrap();

    // Let the reaper park in its idle sleep first.
    time::sleep(Duration::from_millis(10)).await;
    cache.insert(key("a"), 1).unwrap();
    time::sleep(Duration::from_millis(500)).await;

    assert_eq!(expired.all(), vec![(key("a"), 1)]);
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_max_ttl_keeps_entry_live() {
    let counter = Counter::default();
    let expired = Expired::default();
    let cache = cache_with(&counter, &expired);

    cache.insert(key("a"), 1).unwrap();
    assert!(cache.reset_expiration(&key("a"), Duration::MAX));
    cache
        .insert_entry(key("b"), NewEntry::new(2).with_ttl(Duration::from_secs(u64::MAX)))
        .unwrap();
    cache
        .load_or_new_with(key("c"), |_| Ok(NewEntry::new(3).with_ttl(Duration::MAX)))
        .unwrap();
    assert_eq!(cache.load_or_new(key("c")).unwrap(), (3, true));

    time::sleep(Duration::from_secs(3600)).await;
    for name in ["a", "b", "c"] {
        assert!(cache.contains_key(&key(name)), "{name} expired early");
    }
    assert!(expired.all().is_empty());

    // A short reset still takes effect afterwards.
    assert!(cache.reset_expiration(&key("a"), Duration::from_millis(10)));
    time::sleep(Duration::from_millis(20)).await;
    assert_eq!(expired.all(), vec![(key("a"), 1)]);
}
