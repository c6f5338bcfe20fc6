use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for a single activity.
///
/// delay(n) = min(initial_interval * backoff_coefficient^(n-1), max_interval),
/// where n is the attempt that just failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_interval_ms: u64,
    /// Total attempts including the first one.
    pub maximum_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        initial_interval: Duration,
        backoff_coefficient: f64,
        max_interval: Duration,
        maximum_attempts: u32,
    ) -> Self {
        Self {
            initial_interval_ms: initial_interval.as_millis() as u64,
            backoff_coefficient,
            max_interval_ms: max_interval.as_millis() as u64,
            maximum_attempts,
        }
    }

    /// Single attempt, nothing retried.
    pub fn no_retry() -> Self {
        Self::new(Duration::ZERO, 1.0, Duration::ZERO, 1)
    }

    pub fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.maximum_attempts.max(1)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_interval_ms as f64 * self.backoff_coefficient.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_interval_ms as f64);

        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.maximum_attempts == 0 {
            return Err("maximum_attempts must be at least 1".into());
        }
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err("backoff_coefficient must be a finite value >= 1.0".into());
        }
        if self.initial_interval_ms > self.max_interval_ms {
            return Err("initial_interval_ms must not exceed max_interval_ms".into());
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(60), 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let policy = RetryPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(1), 10);

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn attempt_ceiling() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(4), 2);

        assert!(policy.has_attempts_left(1));
        assert!(!policy.has_attempts_left(2));
        assert!(!RetryPolicy::no_retry().has_attempts_left(1));
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let mut policy = RetryPolicy::default();
        policy.backoff_coefficient = 0.5;

        assert!(policy.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }
}
