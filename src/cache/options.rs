//! Cache Options Module
//!
//! Builder-style configuration shared by [`ExpireCache`] and [`TimedMap`].

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ExpireCache, NewEntry};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::timed::TimedMap;

/// Produces the value for a missing key.
pub type Factory<K, V> = Arc<dyn Fn(&K) -> anyhow::Result<NewEntry<K, V>> + Send + Sync>;

/// Receives a key and its value after the entry has expired.
pub type Notifier<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

// == Cache Options ==
/// Options for building an idle cache.
///
/// ```ignore
/// let cache = CacheOptions::new()
///     .default_ttl(Duration::from_millis(100))
///     .factory(|key: &String| Ok(NewEntry::new(key.len())))
///     .notifier(|key, value| tracing::info!(%key, value, "expired"))
///     .build()?;
/// ```
pub struct CacheOptions<K, V> {
    config: CacheConfig,
    factory: Option<Factory<K, V>>,
    notifier: Option<Notifier<K, V>>,
}

/// Options resolved for one cache instance.
pub(crate) struct Settings<K, V> {
    pub(crate) default_ttl: Duration,
    pub(crate) idle_interval: Duration,
    pub(crate) touch_on_load: bool,
    pub(crate) factory: Option<Factory<K, V>>,
    pub(crate) notifier: Option<Notifier<K, V>>,
}

impl<K, V> CacheOptions<K, V> {
    // == Constructor ==
    /// Starts from [`CacheConfig::default`].
    pub fn new() -> Self {
        Self::from_config(CacheConfig::default())
    }

    /// Starts from an explicit configuration, e.g. [`CacheConfig::from_env`].
    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            factory: None,
            notifier: None,
        }
    }

    /// Cache-wide idle timeout. Zero is rejected when the cache is built.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    /// How long the reaper sleeps when nothing is scheduled to expire.
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.config.idle_interval = interval;
        self
    }

    /// Whether a plain `load` counts as a touch.
    pub fn touch_on_load(mut self, touch: bool) -> Self {
        self.config.touch_on_load = Some(touch);
        self
    }

    /// Factory invoked on a `load_or_new` miss.
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&K) -> anyhow::Result<NewEntry<K, V>> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Cache-wide expiry notifier, used for entries without their own.
    pub fn notifier<F>(mut self, notifier: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    pub(crate) fn into_settings(self, default_touch_on_load: bool) -> Result<Settings<K, V>> {
        self.config.validate()?;
        Ok(Settings {
            default_ttl: self.config.default_ttl,
            idle_interval: self.config.idle_interval,
            touch_on_load: self.config.touch_on_load.unwrap_or(default_touch_on_load),
            factory: self.factory,
            notifier: self.notifier,
        })
    }
}

impl<K: 'static, V: Default + 'static> CacheOptions<K, V> {
    /// Uses `V::default()` with the cache-wide TTL as the factory.
    pub fn default_factory(self) -> Self {
        self.factory(|_| Ok(NewEntry::new(V::default())))
    }
}

impl<K, V> CacheOptions<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds a cache backed by a shared expiry index and a single reaper task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<ExpireCache<K, V>> {
        ExpireCache::with_options(self)
    }

    /// Builds a cache where every entry owns its own timer task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build_timed(self) -> Result<TimedMap<K, V>> {
        TimedMap::with_options(self)
    }
}

impl<K, V> Default for CacheOptions<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for CacheOptions<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("config", &self.config)
            .field("factory", &self.factory.is_some())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}
