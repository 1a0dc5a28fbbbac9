//! Retry pacing for failed accepts and backend connects.

use std::time::Duration;

use rand::Rng;

/// Doubling delay from `base` up to `max`, plus up to a tenth of jitter.
/// Tracks consecutive failures until [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record a failure and return how long to wait before trying again.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 1u32.checked_shl(self.failures - 1).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);

        let jitter_ms = (delay.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..jitter_ms)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(1000));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(10) && first < Duration::from_millis(11));
        backoff.next_delay();
        let third = backoff.next_delay();
        assert!(third >= Duration::from_millis(40) && third < Duration::from_millis(44));
        assert_eq!(backoff.failures(), 3);

        for _ in 0..40 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_millis(1000) && capped < Duration::from_millis(1100));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(20), Duration::from_secs(1));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.next_delay() < Duration::from_millis(23));
    }
}
