//! Monotonic region timestamps
//!
//! Timestamps are wall-clock milliseconds shifted left by [`TIMESTAMP_SHIFT`] bits, which
//! leaves room for 4096 strictly increasing values per millisecond.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub type Timestamp = u64;

pub const TIMESTAMP_SHIFT: u32 = 12;

/// Issues strictly increasing timestamps shared by every region of a factory
#[derive(Debug, Default)]
pub struct Timestamper {
    last: AtomicU64,
}

impl Timestamper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Timestamp {
        let now = (Utc::now().timestamp_millis().max(0) as u64) << TIMESTAMP_SHIFT;
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = if now > last { now } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(observed) => last = observed,
            }
        }
    }

    /// Timestamp `timeout` after now
    pub fn deadline(&self, timeout: Duration) -> Timestamp {
        self.next()
            .saturating_add((timeout.as_millis() as u64) << TIMESTAMP_SHIFT)
    }
}
