//! Time source used for staleness decisions.

use std::fmt::Debug;

use chrono::Utc;

use crate::identity::Timestamp;

/// Source of the current time. Injected so staleness windows can be driven
/// deterministically in tests.
pub trait Clock: Debug + Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}
