//! Injected time source.
//!
//! Session expiry and every persisted timestamp read the clock through this
//! trait so scenario tests can move time forward without sleeping.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            nanos: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or_default()),
        }
    }
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }
    pub fn advance(&self, by: Duration) {
        let step = by.num_nanoseconds().unwrap_or(i64::MAX);
        self.nanos.fetch_add(step, Ordering::SeqCst);
    }
    pub fn set(&self, to: DateTime<Utc>) {
        self.nanos
            .store(to.timestamp_nanos_opt().unwrap_or_default(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.nanos.load(Ordering::SeqCst))
    }
}
