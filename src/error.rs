//! Error types for the idle caches
//!
//! Provides unified error handling using thiserror.

use std::time::Duration;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for cache construction and cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A TTL resolved to zero, either at construction or at insertion time
    #[error("Invalid TTL: {0:?} (must be greater than zero)")]
    InvalidTtl(Duration),

    /// A configuration value could not be used
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `load_or_new` was called with no default factory and no override
    #[error("No value factory configured for this cache")]
    MissingFactory,

    /// The cache was built outside of a tokio runtime
    #[error("No tokio runtime available to run background expiry")]
    NoRuntime,

    /// The value factory failed; nothing was inserted
    #[error("Value factory failed: {0}")]
    Factory(#[source] anyhow::Error),
}

impl CacheError {
    /// Returns true for errors caused by how the cache or the call was configured.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CacheError::InvalidTtl(_)
                | CacheError::InvalidConfig(_)
                | CacheError::MissingFactory
                | CacheError::NoRuntime
        )
    }
}

// == Result Type Alias ==
/// Convenience Result type for the caches.
pub type Result<T> = std::result::Result<T, CacheError>;
