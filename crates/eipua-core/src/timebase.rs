use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Pairs a monotonic origin with the wall clock so sampling times can be
/// reported as Unix microseconds while deadlines stay monotonic.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    start: Instant,
    start_unix_us: u64,
}

impl TimeBase {
    pub fn new() -> Self {
        Self::anchored(Instant::now())
    }

    /// Anchor the timebase to a caller-supplied monotonic origin.
    pub fn anchored(start: Instant) -> Self {
        Self {
            start,
            start_unix_us: unix_now_us(),
        }
    }

    /// Monotonic microseconds since start.
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Wall-clock microseconds since the Unix epoch.
    pub fn unix_us(&self) -> u64 {
        unix_now_us()
    }

    /// Unix microseconds of a monotonic instant, relative to the anchor.
    pub fn unix_us_at(&self, at: Instant) -> u64 {
        let since_start = at.saturating_duration_since(self.start);
        self.start_unix_us
            .saturating_add(since_start.as_micros() as u64)
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

pub fn unix_now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
