//! Exponential backoff for peers owing a full sync.

use std::time::Duration;
use weft_model::Clock;

/// Retry pacing for one peer. A fresh controller may fire
/// immediately; each reported failure doubles the delay up to the
/// cap. Success is signaled by dropping the entry.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    current_delay: Duration,
    next_attempt_at_ms: u64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current_delay: Duration::ZERO,
            next_attempt_at_ms: 0,
        }
    }

    pub fn can_try_now(&self, clock: &impl Clock) -> bool {
        clock.now_ms() >= self.next_attempt_at_ms
    }

    pub fn report_failure(&mut self, clock: &impl Clock) {
        let doubled = self.current_delay.saturating_mul(2);
        self.current_delay = doubled.clamp(self.base, self.max);
        self.next_attempt_at_ms = clock.now_ms() + self.current_delay.as_millis() as u64;
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}
