//! Reconnect delay policy for the input side

use std::time::Duration;

use crate::BackoffConfig;

/// Capped exponential backoff. Attempts are unbounded; only the delay is capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempts: u64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            current: initial,
            attempts: 0,
        }
    }

    /// Constant delay between attempts
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0)
    }

    /// Delay to wait before the next attempt; grows the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts += 1;
        let grown = self.current.as_secs_f64() * self.multiplier;
        self.current = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));
        delay
    }

    /// Called after a successful connect
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Failed attempts since the last reset
    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_ms),
            Duration::from_millis(config.max_ms),
            config.multiplier,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_until_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 2.0);
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn never_gives_up() {
        let mut backoff = Backoff::fixed(Duration::from_millis(250));
        for _ in 0..10_000 {
            assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(2), 3.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
