//! Shared exponential backoff.
//!
//! Base 250 ms, factor 2, capped at 30 s. Per-batch failures retry with this
//! schedule and are elevated to fatal after 5 minutes of continuous failure.

use std::time::Duration;

/// Default base delay.
pub const BASE_DELAY: Duration = Duration::from_millis(250);

/// Default delay cap.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Continuous-failure budget before elevation to fatal.
pub const FAILURE_DEADLINE: Duration = Duration::from_secs(300);

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, doubling up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(30);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.base.saturating_mul(1u32 << exp.min(20));
        delay.min(self.cap)
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forget past failures after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BASE_DELAY, MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_doubles_to_cap() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));

        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), MAX_DELAY);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }
}
