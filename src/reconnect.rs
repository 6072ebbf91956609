//! Reconnect policy for a Worker's owned driver.
//!
//! Adapted from this codebase's original connection health monitor, with
//! one deliberate change: rather than keep a private failure-count/circuit
//! state duplicating what the driver already tracks, the policy reads the
//! driver's own [`DriverStatistics`] as the single source of truth for
//! consecutive-failure counting. There is exactly one place a Driver's
//! health is recorded, and the Worker only layers backoff math on top.

use crate::drivers::DriverStatistics;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            max_retry_attempts: 10,
        }
    }
}

/// Tracks consecutive connection failures since the last successful
/// connect, purely in terms of the driver's own statistics snapshot deltas
/// — this struct holds no duplicate counters of its own besides the
/// baseline it diffs against.
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    stats: Arc<DriverStatistics>,
    attempts_since_success: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig, stats: Arc<DriverStatistics>) -> Self {
        Self { config, stats, attempts_since_success: 0 }
    }

    pub fn record_connect_failure(&mut self) {
        self.attempts_since_success = self.attempts_since_success.saturating_add(1);
        self.stats.record_reconnect();
    }

    pub fn record_connect_success(&mut self) {
        self.attempts_since_success = 0;
    }

    pub fn next_backoff(&self) -> Duration {
        let delay_ms = (self.config.initial_backoff_ms as f64
            * self.config.backoff_multiplier.powi(self.attempts_since_success as i32)) as u64;
        Duration::from_millis(delay_ms.min(self.config.max_backoff_ms))
    }

    pub fn is_max_retries_reached(&self) -> bool {
        self.config.max_retry_attempts != 0 && self.attempts_since_success >= self.config.max_retry_attempts
    }

    pub fn attempts_since_success(&self) -> u32 {
        self.attempts_since_success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let stats = DriverStatistics::new();
        let mut policy = ReconnectPolicy::new(
            ReconnectConfig { initial_backoff_ms: 100, max_backoff_ms: 1000, backoff_multiplier: 2.0, max_retry_attempts: 0 },
            stats,
        );
        assert_eq!(policy.next_backoff(), Duration::from_millis(100));
        policy.record_connect_failure();
        assert_eq!(policy.next_backoff(), Duration::from_millis(200));
        policy.record_connect_failure();
        assert_eq!(policy.next_backoff(), Duration::from_millis(400));
        for _ in 0..10 {
            policy.record_connect_failure();
        }
        assert_eq!(policy.next_backoff(), Duration::from_millis(1000));
    }

    #[test]
    fn max_retries_reached_after_threshold() {
        let stats = DriverStatistics::new();
        let mut policy = ReconnectPolicy::new(
            ReconnectConfig { initial_backoff_ms: 10, max_backoff_ms: 100, backoff_multiplier: 2.0, max_retry_attempts: 3 },
            stats,
        );
        assert!(!policy.is_max_retries_reached());
        for _ in 0..3 {
            policy.record_connect_failure();
        }
        assert!(policy.is_max_retries_reached());
    }

    #[test]
    fn success_resets_attempt_counter() {
        let stats = DriverStatistics::new();
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default(), stats);
        policy.record_connect_failure();
        policy.record_connect_failure();
        assert_eq!(policy.attempts_since_success(), 2);
        policy.record_connect_success();
        assert_eq!(policy.attempts_since_success(), 0);
    }

    #[test]
    fn zero_max_retries_means_infinite() {
        let stats = DriverStatistics::new();
        let mut policy = ReconnectPolicy::new(
            ReconnectConfig { max_retry_attempts: 0, ..ReconnectConfig::default() },
            stats,
        );
        for _ in 0..1000 {
            policy.record_connect_failure();
        }
        assert!(!policy.is_max_retries_reached());
    }
}
