//! Node retry policy with configurable backoff and jitter.
//!
//! Retries are a graph-level policy: the executor consults
//! [`should_retry`] after every failed attempt. Only failures flagged as
//! retryable (external-call failures) are ever retried.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    #[default]
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Retry policy for one node.
///
/// The default is three retries (four attempts) five minutes apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 5 * 60 * 1000,
            max_delay_ms: 60 * 60 * 1000,
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates the default retry policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts (values below 1 are treated as 1).
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }
}

/// Retry bookkeeping for one node execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryState {
    retries: u32,
}

impl RetryState {
    /// Creates a fresh state (no attempts retried yet).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of retries scheduled so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// The 1-based number of the attempt currently running.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    /// Returns true once the current attempt is the last one allowed.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt() >= config.max_attempts
    }

    /// Calculates the delay before the next attempt.
    #[must_use]
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;

        let delay = match config.backoff {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(self.retries)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(self.retries) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full if delay == 0 => 0,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=delay),
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// Attempts are exhausted.
    GiveUp,
    /// The failure is not retryable.
    NotRetryable,
}

/// Decides whether a failed attempt is retried, advancing the state when it is.
#[must_use]
pub fn should_retry(state: &mut RetryState, config: &RetryConfig, retryable: bool) -> RetryDecision {
    if !retryable {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(config) {
        return RetryDecision::GiveUp;
    }

    let delay = state.calculate_delay(config);
    state.retries += 1;
    RetryDecision::Retry(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_fixed_backoff() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.base_delay_ms, 300_000);
        assert_eq!(config.backoff, BackoffStrategy::Constant);
        assert_eq!(config.jitter, JitterStrategy::None);
    }

    #[test]
    fn test_builder() {
        let config = RetryConfig::new()
            .with_max_attempts(0)
            .with_base_delay_ms(500)
            .with_max_delay_ms(10_000)
            .with_backoff(BackoffStrategy::Linear)
            .with_jitter(JitterStrategy::Equal);

        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.base_delay_ms, 500);
        assert_eq!(config.backoff, BackoffStrategy::Linear);
        assert_eq!(config.jitter, JitterStrategy::Equal);
    }

    #[test]
    fn test_calculate_delay_strategies() {
        let exp = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Exponential);
        let linear = exp.clone().with_backoff(BackoffStrategy::Linear);
        let constant = exp.clone().with_backoff(BackoffStrategy::Constant);

        let mut state = RetryState::new();
        assert_eq!(state.calculate_delay(&exp), Duration::from_millis(100));
        state.retries = 2;
        assert_eq!(state.calculate_delay(&exp), Duration::from_millis(400));
        assert_eq!(state.calculate_delay(&linear), Duration::from_millis(300));
        assert_eq!(state.calculate_delay(&constant), Duration::from_millis(100));
    }

    #[test]
    fn test_calculate_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_backoff(BackoffStrategy::Exponential);
        let state = RetryState { retries: 10 };
        assert_eq!(state.calculate_delay(&config), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::Full);
        let state = RetryState::new();
        for _ in 0..10 {
            assert!(state.calculate_delay(&config) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_should_retry_until_exhausted() {
        let config = RetryConfig::new().with_max_attempts(3).with_base_delay_ms(1);
        let mut state = RetryState::new();

        assert_eq!(state.attempt(), 1);
        assert!(matches!(should_retry(&mut state, &config, true), RetryDecision::Retry(_)));
        assert_eq!(state.attempt(), 2);
        assert!(matches!(should_retry(&mut state, &config, true), RetryDecision::Retry(_)));
        assert_eq!(state.attempt(), 3);
        assert_eq!(should_retry(&mut state, &config, true), RetryDecision::GiveUp);
        assert_eq!(state.retries(), 2);
    }

    #[test]
    fn test_should_retry_not_retryable() {
        let config = RetryConfig::new();
        let mut state = RetryState::new();
        assert_eq!(should_retry(&mut state, &config, false), RetryDecision::NotRetryable);
        assert_eq!(state.retries(), 0);
    }

    #[test]
    fn test_none_never_retries() {
        let mut state = RetryState::new();
        assert_eq!(should_retry(&mut state, &RetryConfig::none(), true), RetryDecision::GiveUp);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: RetryConfig =
            serde_json::from_value(serde_json::json!({"max_attempts": 2, "backoff": "linear"}))
                .unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.backoff, BackoffStrategy::Linear);
        assert_eq!(config.base_delay_ms, 300_000);
    }
}
