//! Wall-clock source for validity decisions.
//!
//! Certificate validity is expressed in wall-clock time, while the renewal
//! loop sleeps on the tokio timer. The clock is injectable so tests can tie
//! the two together under paused time.

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
