//! Configuration types for pipes, retries, and reconnection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capacity settings for a pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Maximum buffered items before producers experience backpressure.
    pub capacity: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self { capacity: 128 }
    }
}

/// Bounded retry with exponential backoff for destination puts.
///
/// The backoff curve is configurable rather than hard-coded; the defaults
/// match the behavior tuned in production (three retries, exponential
/// delay capped at ten seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first failed put.
    pub max_retries: u32,
    /// How long each individual put waits for buffer space.
    pub put_timeout_ms: u64,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single backoff delay.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            put_timeout_ms: 100,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms)
    }

    /// Backoff before retry `attempt` (1-based), exponential and capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        Duration::from_millis((delay as u64).min(self.max_backoff_ms))
    }
}

/// Reconnection supervision for stream connectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay between a disconnect and the next connect attempt.
    pub interval_ms: u64,
    /// Consecutive failed passes tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.put_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            backoff_multiplier: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_yaml_parsing_with_defaults() {
        let yaml = r#"
max_retries: 5
put_timeout_ms: 250
"#;
        let policy: RetryPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.put_timeout_ms, 250);
        // Unspecified fields fall back to defaults.
        assert_eq!(policy.max_backoff_ms, 10_000);

        let reconnect: ReconnectPolicy = serde_yaml::from_str("interval_ms: 1000").unwrap();
        assert_eq!(reconnect.interval(), Duration::from_secs(1));
        assert_eq!(reconnect.max_attempts, 5);

        let pipe: PipeConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(pipe.capacity, 128);
    }
}
