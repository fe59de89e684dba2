//! Cache Module
//!
//! Provides the indexed idle cache: an entry store, a deadline-ordered expiry
//! index and the options shared with the per-entry-timer variant.

mod entry;
mod index;
mod loading;
mod options;
pub(crate) mod stats;
mod store;


// Re-export public types
pub use entry::{CacheEntry, NewEntry};
pub use index::ExpiryIndex;
pub use options::{CacheOptions, Factory, Notifier};
pub use stats::CacheStats;
pub use store::ExpireCache;

pub(crate) use entry::deadline_after;
pub(crate) use loading::{InFlight, LoadRole};
pub(crate) use options::Settings;
