use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enums::RetryBackoff;

/// Retry policy applied by activity workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total attempts including the first one. `0` is treated as `1`.
  pub max_attempts: u32,
  pub initial_interval_ms: u64,
  pub backoff: RetryBackoff,
  pub backoff_coefficient: f64,
  pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_interval_ms: 100,
      backoff: RetryBackoff::Exponential,
      backoff_coefficient: 2.0,
      max_interval_ms: 10_000,
    }
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn no_retry() -> Self {
    Self {
      max_attempts: 1,
      ..Self::default()
    }
  }

  pub fn attempts(&self) -> u32 {
    self.max_attempts.max(1)
  }

  /// Delay to wait before `attempt` (1-based; the first retry is attempt 2).
  pub fn delay_before(&self, attempt: u32) -> Duration {
    let retry = attempt.saturating_sub(1).max(1);
    let base = self.initial_interval_ms as f64;
    let millis = match self.backoff {
      RetryBackoff::Constant => base,
      RetryBackoff::Linear => base * retry as f64,
      RetryBackoff::Exponential => base * self.backoff_coefficient.powi(retry as i32 - 1),
    };
    Duration::from_millis(millis.min(self.max_interval_ms as f64) as u64)
  }
}

/// Defaults for activities that do not carry their own options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityOptions {
  pub start_to_close_timeout_ms: u64,
  pub retry: RetryPolicy,
}

impl Default for ActivityOptions {
  fn default() -> Self {
    Self {
      start_to_close_timeout_ms: 60_000,
      retry: RetryPolicy::default(),
    }
  }
}

impl ActivityOptions {
  pub fn start_to_close_timeout(&self) -> Duration {
    Duration::from_millis(self.start_to_close_timeout_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exponential_delays_are_capped() {
    let policy = RetryPolicy {
      max_attempts: 10,
      initial_interval_ms: 100,
      backoff: RetryBackoff::Exponential,
      backoff_coefficient: 2.0,
      max_interval_ms: 500,
    };

    assert_eq!(policy.delay_before(2), Duration::from_millis(100));
    assert_eq!(policy.delay_before(3), Duration::from_millis(200));
    assert_eq!(policy.delay_before(4), Duration::from_millis(400));
    assert_eq!(policy.delay_before(5), Duration::from_millis(500));
  }

  #[test]
  fn test_linear_and_constant_delays() {
    let linear = RetryPolicy {
      backoff: RetryBackoff::Linear,
      ..RetryPolicy::default()
    };
    assert_eq!(linear.delay_before(4), Duration::from_millis(300));

    let constant = RetryPolicy {
      backoff: RetryBackoff::Constant,
      ..RetryPolicy::default()
    };
    assert_eq!(constant.delay_before(7), Duration::from_millis(100));
  }

  #[test]
  fn test_zero_attempts_means_one() {
    let policy = RetryPolicy {
      max_attempts: 0,
      ..RetryPolicy::default()
    };
    assert_eq!(policy.attempts(), 1);
    assert_eq!(RetryPolicy::no_retry().attempts(), 1);
  }
}
