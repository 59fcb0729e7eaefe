//! Time authority for the engine.
//!
//! Every scheduling decision reads "now" through a [`Clock`]; nothing else in
//! the crate calls `Utc::now()`. Compute budgets use [`Deadline`], which is
//! measured on the monotonic clock and therefore unaffected by fake clocks.

use std::sync::RwLock;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date of `now()` in the given offset.
    fn today(&self, offset: FixedOffset) -> NaiveDate {
        self.now().with_timezone(&offset).date_naive()
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    current: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: RwLock::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        // A poisoned lock still holds a valid instant.
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Monotonic compute budget carried through long-running steps.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires: Option<Instant>,
}

impl Deadline {
    pub fn after(budget: StdDuration) -> Self {
        Self {
            expires: Instant::now().checked_add(budget),
        }
    }

    /// A deadline that never expires.
    pub fn unbounded() -> Self {
        Self { expires: None }
    }

    pub fn expired(&self) -> bool {
        self.expires.is_some_and(|at| Instant::now() >= at)
    }

    pub fn remaining(&self) -> Option<StdDuration> {
        self.expires
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}
