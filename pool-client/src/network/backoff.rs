//! Capped exponential backoff with jitter for reconnect attempts

use crate::config::BackoffConfig;
use std::time::Duration;

/// Reconnect delay calculator
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    /// Create from configuration
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay before the next attempt after `failures` consecutive failures
    ///
    /// `failures == 0` means no wait.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (failures - 1).min(i32::MAX as u32) as i32;
        let base_delay =
            self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);

        // Cap at max_delay
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Largest delay this policy can produce, jitter included
    pub fn max_delay(&self) -> Duration {
        let max = self.config.max_delay_ms as f64 * (1.0 + self.config.jitter_factor);
        Duration::from_millis(max.ceil() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_exponentially() {
        let backoff = Backoff::new(BackoffConfig {
            jitter_factor: 0.0,
            ..Default::default()
        });

        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = Backoff::new(BackoffConfig::default());
        for failures in 1..200 {
            assert!(backoff.delay(failures) <= backoff.max_delay());
        }
        assert!(backoff.delay(100) >= Duration::from_millis(9_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..100 {
            let delay = backoff.delay(1).as_millis();
            assert!((90..=110).contains(&delay), "delay {} out of range", delay);
        }
    }
}
