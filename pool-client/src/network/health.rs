//! Rolling per-node health score

use crate::config::HealthConfig;
use std::time::Duration;

/// Exponentially weighted health score in `[0, 1]`
///
/// A success contributes `reference / (reference + latency)`, so a reply at
/// the reference latency counts 0.5 and an instant one counts 1.0. A failure
/// contributes 0. New nodes start at 1.0.
#[derive(Debug, Clone)]
pub struct HealthScore {
    score: f64,
    successes: u64,
    failures: u64,
    avg_latency_ms: f64,
}

impl Default for HealthScore {
    fn default() -> Self {
        Self {
            score: 1.0,
            successes: 0,
            failures: 0,
            avg_latency_ms: 0.0,
        }
    }
}

impl HealthScore {
    /// Record a successful exchange
    pub fn record_success(&mut self, latency: Duration, config: &HealthConfig) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let reference = config.reference_latency_ms.max(1) as f64;
        let sample = reference / (reference + latency_ms);

        self.observe(sample, config.alpha);
        self.avg_latency_ms = if self.successes == 0 {
            latency_ms
        } else {
            config.alpha * latency_ms + (1.0 - config.alpha) * self.avg_latency_ms
        };
        self.successes += 1;
    }

    /// Record a failed dial or exchange
    pub fn record_failure(&mut self, config: &HealthConfig) {
        self.observe(0.0, config.alpha);
        self.failures += 1;
    }

    fn observe(&mut self, sample: f64, alpha: f64) {
        self.score = (alpha * sample + (1.0 - alpha) * self.score).clamp(0.0, 1.0);
    }

    /// Current score
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Smoothed latency of successful exchanges
    pub fn avg_latency_ms(&self) -> f64 {
        self.avg_latency_ms
    }

    /// Total successes recorded
    pub fn successes(&self) -> u64 {
        self.successes
    }

    /// Total failures recorded
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Whether the node should be tried after healthier ones
    pub fn below_floor(&self, config: &HealthConfig) -> bool {
        self.score < config.floor
    }

    /// Score rounded to tenths, so near-equal nodes compare as ties
    pub fn bucket(&self) -> u8 {
        (self.score * 10.0).round() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_is_healthy() {
        let health = HealthScore::default();
        assert_eq!(health.score(), 1.0);
        assert!(!health.below_floor(&HealthConfig::default()));
    }

    #[test]
    fn test_failures_drop_below_floor() {
        let config = HealthConfig::default();
        let mut health = HealthScore::default();
        for _ in 0..4 {
            health.record_failure(&config);
        }
        assert!(health.below_floor(&config));
        assert_eq!(health.failures(), 4);

        // Fast successes recover the score
        for _ in 0..10 {
            health.record_success(Duration::from_millis(1), &config);
        }
        assert!(!health.below_floor(&config));
    }

    #[test]
    fn test_close_scores_share_a_bucket() {
        let config = HealthConfig::default();
        let mut fast = HealthScore::default();
        let mut slower = HealthScore::default();
        fast.record_success(Duration::from_millis(1), &config);
        slower.record_success(Duration::from_millis(5), &config);

        assert!(fast.score() > slower.score());
        assert_eq!(fast.bucket(), slower.bucket());
        assert_eq!(HealthScore::default().bucket(), 10);

        slower.record_failure(&config);
        slower.record_failure(&config);
        assert!(slower.bucket() < fast.bucket());
    }

    #[test]
    fn test_slow_replies_score_lower() {
        let config = HealthConfig::default();
        let mut fast = HealthScore::default();
        let mut slow = HealthScore::default();
        for _ in 0..10 {
            fast.record_success(Duration::from_millis(10), &config);
            slow.record_success(Duration::from_millis(2_000), &config);
        }
        assert!(fast.score() > slow.score());
        assert!(slow.avg_latency_ms() > fast.avg_latency_ms());
    }
}
