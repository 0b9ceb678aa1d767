//! Injected dependencies that are not part of the broker or the store.

use chrono::{DateTime, Utc};

/// Source of the current time.
///
/// Injected so tests can stamp `time_of_action` deterministically.
pub trait Clock: Send + Sync {
    /// Current time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
