//! Idle Cache - concurrent in-process maps with idle-timeout expiry
//!
//! Entries expire after a period without access and a notifier receives each
//! expired value exactly once. Two variants share one API:
//!
//! - [`ExpireCache`]: a deadline-ordered index swept by one background reaper.
//! - [`TimedMap`]: every entry owns a timer task that it resets on access.
//!
//! Both run their background work on the tokio runtime they are built in.

pub mod cache;
pub mod config;
pub mod error;
mod tasks;
pub mod timed;

pub use cache::{CacheOptions, CacheStats, ExpireCache, NewEntry};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use timed::TimedMap;
