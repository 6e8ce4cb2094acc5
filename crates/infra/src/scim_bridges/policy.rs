//! Sync cadence and failure backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for failed syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every failure
    Fixed,
    /// base * failures
    Linear,
    /// base * 2^(failures - 1)
    #[default]
    Exponential,
}

impl core::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff strategy {other}")),
        }
    }
}

/// Delay before the next attempt after consecutive failures.
///
/// Deterministic (no jitter) and monotonically non-decreasing in the failure
/// count, capped at `max_delay`. A broken integration is never hot-looped and
/// never backed off forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(6 * 60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay for a given number of consecutive failures (1 after the first).
    pub fn delay_for_failures(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(consecutive_failures),
            BackoffStrategy::Exponential => {
                // 2^31 already exceeds any sane cap.
                let exp = (consecutive_failures - 1).min(31);
                self.base_delay.saturating_mul(1u32 << exp)
            }
        };

        delay.min(self.max_delay.max(self.base_delay))
    }
}

/// When a bridge runs again after a sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Delay after a successful sync.
    pub interval: Duration,
    /// Delay after a failed sync, by consecutive failure count.
    pub backoff: BackoffPolicy,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SyncPolicy {
    pub fn next_delay_after_success(&self) -> Duration {
        self.interval
    }

    pub fn next_delay_after_failure(&self, consecutive_failures: u32) -> Duration {
        self.backoff.delay_for_failures(consecutive_failures)
    }
}
