use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, FixedOffset, Utc};

// Source of "now" for the generator, cache and scheduler.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

// Local wall clock, pinned to the system's current offset
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let local = chrono::Local::now();
        let offset_seconds = local.offset().local_minus_utc();
        let fixed = FixedOffset::east_opt(offset_seconds).unwrap_or_else(utc_offset);
        local.with_timezone(&fixed)
    }
}

// Clock that only moves when told to. Used by tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<FixedOffset>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn utc_offset() -> FixedOffset {
    Utc::now().fixed_offset().timezone()
}
