//! Points in time and validity intervals for versioned records.
//!
//! Grants, attachments, and policy versions are never deleted. Each record
//! carries a [`Validity`] interval and lookups ask which record covers a
//! given point in time.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Microseconds since the Unix epoch.
pub type Timestamp = u64;

/// Get the current wall-clock time in microseconds.
pub fn current_timestamp() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Strictly increasing clock shared by one engine.
///
/// Two administrative operations issued in the same microsecond still get
/// distinct timestamps, so validity intervals never collapse.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    /// Create a new clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, greater than every previous one.
    pub fn tick(&self) -> Timestamp {
        let now = current_timestamp();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Last issued timestamp (or the current time if none was issued yet).
    pub fn now(&self) -> Timestamp {
        self.last.load(Ordering::Acquire).max(current_timestamp())
    }

    /// Advance past a timestamp replayed from the durable log.
    pub fn observe(&self, ts: Timestamp) {
        self.last.fetch_max(ts, Ordering::AcqRel);
    }
}

/// Half-open interval `[valid_from, valid_to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    /// First instant the record is in effect.
    pub valid_from: Timestamp,
    /// First instant the record is no longer in effect; `None` while open.
    pub valid_to: Option<Timestamp>,
}

impl Validity {
    /// Open interval starting at `from`.
    pub fn starting(from: Timestamp) -> Self {
        Self {
            valid_from: from,
            valid_to: None,
        }
    }

    /// Check whether the record is in effect at `at`.
    pub fn covers(&self, at: Timestamp) -> bool {
        at >= self.valid_from && self.valid_to.map_or(true, |to| at < to)
    }

    /// Check whether the record has not been closed.
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Close the interval at `at`.
    pub fn close(&mut self, at: Timestamp) {
        if self.valid_to.is_none() {
            self.valid_to = Some(at);
        }
    }
}
