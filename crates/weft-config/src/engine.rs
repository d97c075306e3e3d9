use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::ActivityOptions;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub history: HistoryLimits,
  pub infra_retry: InfraRetry,
  /// How long a cancel request waits for the workflow to unwind before the
  /// engine records the cancellation itself.
  pub cancellation_grace_period_ms: u64,
  pub activity: ActivityOptions,
  /// Capacity of the outbound command channel.
  pub dispatcher_buffer: usize,
  /// Terminal instances kept in memory beyond this count are evicted.
  pub max_cached_instances: usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      history: HistoryLimits::default(),
      infra_retry: InfraRetry::default(),
      cancellation_grace_period_ms: 10_000,
      activity: ActivityOptions::default(),
      dispatcher_buffer: 1024,
      max_cached_instances: 1024,
    }
  }
}

impl EngineConfig {
  /// Parse a configuration from JSON. Missing fields take their defaults.
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  pub fn cancellation_grace_period(&self) -> Duration {
    Duration::from_millis(self.cancellation_grace_period_ms)
  }
}

/// Event-count thresholds per workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryLimits {
  /// Hard cap. The run is failed rather than growing past it.
  pub max_events: u64,
  /// Soft threshold that logs a warning.
  pub warn_events: u64,
}

impl Default for HistoryLimits {
  fn default() -> Self {
    Self {
      max_events: 51_200,
      warn_events: 10_240,
    }
  }
}

/// Bounded retry for infrastructure errors (append conflicts, log outages).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraRetry {
  pub max_attempts: u32,
  pub backoff_ms: u64,
}

impl Default for InfraRetry {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      backoff_ms: 10,
    }
  }
}

impl InfraRetry {
  pub fn backoff(&self) -> Duration {
    Duration::from_millis(self.backoff_ms)
  }
}
