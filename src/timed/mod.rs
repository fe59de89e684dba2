//! Per-Entry Timer Module
//!
//! The simpler topology: every entry owns a watcher task and a timer, and
//! accesses nudge the watcher through a one-slot channel.

mod map;
mod watcher;

pub use map::TimedMap;
