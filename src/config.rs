//! Configuration Module
//!
//! Handles loading cache settings from environment variables.

use std::env;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Environment variable holding the default idle TTL in milliseconds.
pub const ENV_DEFAULT_TTL_MS: &str = "IDLE_CACHE_DEFAULT_TTL_MS";
/// Environment variable holding the reaper idle interval in milliseconds.
pub const ENV_IDLE_INTERVAL_MS: &str = "IDLE_CACHE_IDLE_INTERVAL_MS";
/// Environment variable holding the touch-on-load switch (`true`/`false`).
pub const ENV_TOUCH_ON_LOAD: &str = "IDLE_CACHE_TOUCH_ON_LOAD";

/// Default idle timeout applied when no TTL is configured.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// How long the reaper sleeps when there is nothing to expire.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(60);

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Idle timeout for entries created without an explicit TTL
    pub default_ttl: Duration,
    /// Reaper sleep interval while the expiry index is empty
    pub idle_interval: Duration,
    /// Whether a plain `load` extends the deadline; `None` keeps the variant default
    pub touch_on_load: Option<bool>,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// Unset or malformed variables fall back to the defaults.
    ///
    /// # Environment Variables
    /// - `IDLE_CACHE_DEFAULT_TTL_MS` - Default TTL in milliseconds (default: 60000)
    /// - `IDLE_CACHE_IDLE_INTERVAL_MS` - Reaper idle interval in milliseconds (default: 60000)
    /// - `IDLE_CACHE_TOUCH_ON_LOAD` - `true` or `false` (default: per cache variant)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_ttl: env::var(ENV_DEFAULT_TTL_MS)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_ttl),
            idle_interval: env::var(ENV_IDLE_INTERVAL_MS)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_interval),
            touch_on_load: env::var(ENV_TOUCH_ON_LOAD)
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Like [`CacheConfig::from_env`], but a set variable that does not parse
    /// is reported instead of ignored.
    pub fn try_from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            default_ttl: parse_var(ENV_DEFAULT_TTL_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_ttl),
            idle_interval: parse_var(ENV_IDLE_INTERVAL_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_interval),
            touch_on_load: parse_var(ENV_TOUCH_ON_LOAD)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects a zero TTL or a zero idle interval.
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            return Err(CacheError::InvalidTtl(self.default_ttl));
        }
        if self.idle_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "idle interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            touch_on_load: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CacheError::InvalidConfig(format!("{name}={raw:?} is not valid"))),
        Err(_) => Ok(None),
    }
}
