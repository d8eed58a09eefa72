//! Backoff between provisioning attempts

use crate::config::EngineConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Pick uniformly between half and the full computed delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.retry_initial_backoff_ms),
            backoff_factor: config.retry_backoff_factor,
            max_delay: Duration::from_millis(config.retry_max_backoff_ms),
            jitter: config.retry_jitter,
        }
    }

    /// No waiting between attempts
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before the attempt that follows failure number `failures`
    pub fn delay(&self, failures: u32) -> Duration {
        let base = if failures <= 1 {
            self.initial_delay
        } else {
            let factor = self.backoff_factor.powi(failures as i32 - 1);
            let delay_ms = (self.initial_delay.as_millis() as f64 * factor) as u64;
            Duration::from_millis(delay_ms)
        };
        let capped = base.min(self.max_delay);

        if self.jitter && !capped.is_zero() {
            let scale = rand::rng().random_range(0.5..=1.0);
            capped.mul_f64(scale)
        } else {
            capped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(1_000),
            jitter,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let p = policy(false);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_cap() {
        assert_eq!(policy(false).delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = policy(true);
        for _ in 0..50 {
            let d = p.delay(2);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_defaults_follow_engine_config() {
        let p = RetryPolicy::default();
        assert_eq!(p.initial_delay, Duration::from_millis(200));
        assert!(p.jitter);
        assert_eq!(RetryPolicy::immediate().delay(5), Duration::ZERO);
    }
}
