//! Capped exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Delay sequence for retrying transient failures
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Start a new sequence
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next retry
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        self.attempt = self.attempt.saturating_add(1);

        let max = self.config.max.as_secs_f64();
        let grown = self.config.initial.as_secs_f64() * self.config.multiplier.powi(exponent);
        let base = grown.min(max);
        let jitter = if self.config.jitter > 0.0 {
            base * rand::thread_rng().gen_range(0.0..=self.config.jitter)
        } else {
            0.0
        };

        Duration::from_secs_f64((base + jitter).min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig::new()
            .initial(Duration::from_millis(100))
            .max(Duration::from_millis(1000))
            .multiplier(2.0)
            .jitter(0.0)
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let mut backoff = Backoff::new(config());
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(config());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(config().jitter(0.5));
        for _ in 0..20 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(config());
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }
}
