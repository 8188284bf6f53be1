//! Retry policy configuration and backoff math.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ErrorKind;
use crate::{Error, Result};

/// Jitter applied to computed delays, as a fraction of the delay.
const JITTER_RATIO: f64 = 0.1;

/// Bounded exponential-backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Delay before the first retry, in seconds.
    pub base_delay_secs: f64,
    /// Upper bound for any single delay, in seconds.
    pub max_delay_secs: f64,
    /// Randomize each delay by +/-10%.
    pub jitter: bool,
    /// Error kinds eligible for retry. Empty means every kind.
    pub retry_on: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_factor: 2.0,
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            jitter: true,
            retry_on: vec![
                ErrorKind::Connection,
                ErrorKind::Timeout,
                ErrorKind::Io,
                ErrorKind::Http,
                ErrorKind::Provider,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_secs = delay.as_secs_f64();
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_secs = delay.as_secs_f64();
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.retry_on = kinds;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(Error::config("retry.backoff_factor must be >= 1.0"));
        }
        if !self.base_delay_secs.is_finite() || self.base_delay_secs < 0.0 {
            return Err(Error::config("retry.base_delay_secs must be >= 0"));
        }
        if !self.max_delay_secs.is_finite() || self.max_delay_secs < self.base_delay_secs {
            return Err(Error::config(
                "retry.max_delay_secs must be >= retry.base_delay_secs",
            ));
        }
        Ok(())
    }

    /// Whether an error of this kind may be retried at all.
    pub fn allows(&self, kind: ErrorKind) -> bool {
        self.retry_on.is_empty() || self.retry_on.contains(&kind)
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay = (self.base_delay_secs * self.backoff_factor.powi(exponent))
            .min(self.max_delay_secs);

        if self.jitter {
            let spread = delay * JITTER_RATIO;
            delay += spread * (rand::random::<f64>() * 2.0 - 1.0);
        }

        if !delay.is_finite() {
            delay = self.max_delay_secs;
        }

        Duration::from_secs_f64(delay.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.jitter);
        assert!(policy.allows(ErrorKind::Timeout));
        assert!(!policy.allows(ErrorKind::Format));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_empty_retry_set_allows_everything() {
        let policy = RetryPolicy::default().with_retry_on(Vec::new());
        assert!(policy.allows(ErrorKind::Format));
        assert!(policy.allows(ErrorKind::Other));
    }

    #[test]
    fn test_validation_bounds() {
        assert!(RetryPolicy::default().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::default().with_backoff_factor(0.5).validate().is_err());

        let negative = RetryPolicy {
            base_delay_secs: -1.0,
            ..Default::default()
        };
        assert!(negative.validate().is_err());

        let inverted = RetryPolicy {
            base_delay_secs: 10.0,
            max_delay_secs: 5.0,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_delay_without_jitter() {
        let policy = RetryPolicy::default()
            .with_jitter(false)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(policy.calculate_delay(0), Duration::ZERO);
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(policy.calculate_delay(4), Duration::from_secs(8));
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(10));
        assert_eq!(policy.calculate_delay(50), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_is_monotonic_until_saturation() {
        let policy = RetryPolicy::default()
            .with_jitter(false)
            .with_backoff_factor(1.5)
            .with_base_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(30));

        let mut previous = Duration::ZERO;
        for attempt in 1..=40 {
            let delay = policy.calculate_delay(attempt);
            assert!(delay >= previous, "attempt {attempt} decreased");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(60));

        for _ in 0..100 {
            let delay = policy.calculate_delay(1).as_secs_f64();
            assert!((9.0..=11.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_deserialize_partial() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 5, "retry_on": ["timeout"]}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_factor, 2.0);
        assert_eq!(policy.retry_on, vec![ErrorKind::Timeout]);
    }
}
