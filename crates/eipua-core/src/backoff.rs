use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Exponential reconnect backoff with additive jitter.
///
/// Every calculation is a pure function of the failure count, the caller's
/// clock reading and a jitter sample in `[0, 1)`, so no timer state lives here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the jitter as a fraction of the computed delay.
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter_ratio: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// `min(max, base * 2^n)`; `delay(0)` is the base delay.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let factor = 1u32
            .checked_shl(consecutive_failures)
            .unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn jitter(&self, delay: Duration, sample: f64) -> Duration {
        let sample = if sample.is_finite() {
            sample.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        delay.mul_f64(ratio * sample)
    }

    /// Earliest instant at which the next reconnect attempt may start.
    pub fn backoff_until(&self, consecutive_failures: u32, now: Instant, sample: f64) -> Instant {
        let delay = self.delay(consecutive_failures);
        now + delay + self.jitter(delay, sample)
    }
}
