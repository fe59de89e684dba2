//! Background Tasks Module
//!
//! Contains the tasks that expire cache entries independently of callers.
//!
//! # Tasks
//! - Reaper: sleeps until the next deadline and sweeps an [`ExpireCache`](crate::ExpireCache)
//! - Notify: runs expiry notifiers with panics contained

mod notify;
mod reaper;

pub(crate) use notify::{dispatch_expired, notify_one};
pub(crate) use reaper::{spawn_reaper, Reap, ReaperGuard};
