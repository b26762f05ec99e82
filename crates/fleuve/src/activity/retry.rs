//! Retry policy for activity execution.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff growth curve between activity attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

/// Retry behavior for failed activities.
///
/// The delay before retry `k` (0-based) is
/// `clamp(min · factor^k, min, max) · (1 + uniform(−jitter, +jitter))`
/// for the exponential strategy, and the analogous
/// `clamp(min · max(1, factor · k), min, max)` form for the linear one.
/// After `max_retries` retries the activity is dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub factor: f64,
    pub min: Duration,
    pub max: Duration,
    /// Relative jitter in `[0, 1]` applied multiplicatively to each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            factor: 2.0,
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay before retry `k` (0-based), without jitter.
    pub fn delay_for_retry(&self, k: u32) -> Duration {
        let min = self.min.as_secs_f64();
        let max = self.max.as_secs_f64().max(min);
        let base = match self.strategy {
            BackoffStrategy::Exponential => min * self.factor.powi(k as i32),
            BackoffStrategy::Linear => min * (self.factor * f64::from(k)).max(1.0),
        };
        Duration::from_secs_f64(base.clamp(min, max))
    }

    /// Delay before retry `k` with jitter applied.
    pub fn jittered_delay(&self, k: u32) -> Duration {
        let base = self.delay_for_retry(k);
        if self.jitter <= 0.0 {
            return base;
        }
        let jitter = self.jitter.min(1.0);
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + spread)).max(0.0))
    }

    /// True while another retry is allowed after `retry_count` failures.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }
}
