//! Exponential backoff with jitter for key-vault and AAD retries.

use std::time::Duration;

/// Exponential backoff with ±25% jitter.
///
/// Retry policies here are bounded in attempts, not wall-clock; the caller
/// owns the attempt counter and asks for one delay per retry.
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// Backoff for transport-level retries: base interval doubling up to
    /// sixteen times the base.
    pub fn for_transport(interval: Duration) -> Self {
        Self::new(interval, interval * 16, 2.0)
    }

    /// The next delay to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(
            self.max,
            Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier),
        );
        // ±25% jitter keeps concurrent retriers from synchronising.
        let jitter = rand::random::<f64>() * 0.5 - 0.25;
        Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter))
    }

    /// Reset to the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_increase_geometrically() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(10_000),
            2.0,
        );
        let first = backoff.next_delay();
        assert!(first.as_millis() >= 75 && first.as_millis() <= 125);
        let second = backoff.next_delay();
        assert!(second.as_millis() >= 150 && second.as_millis() <= 250);
    }

    #[test]
    fn delay_caps_at_max() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            10.0,
        );
        let _ = backoff.next_delay();
        let capped = backoff.next_delay();
        // Max 2000ms plus 25% jitter headroom.
        assert!(capped.as_millis() <= 2500);
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(10_000),
            2.0,
        );
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        backoff.reset();
        let after_reset = backoff.next_delay();
        assert!(after_reset.as_millis() <= 125);
    }
}
