//! Process-wide monotonic clock in microseconds

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Microseconds elapsed since the first clock read in this process.
pub fn now_us() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}

/// Age of a timestamp produced by [`now_us`].
pub fn since_us(timestamp_us: u64) -> Duration {
    Duration::from_micros(now_us().saturating_sub(timestamp_us))
}
