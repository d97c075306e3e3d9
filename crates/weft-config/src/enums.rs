use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
  Constant,
  Linear,
  #[default]
  Exponential,
}

/// What a schedule does with triggers it missed while the process was busy or down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedTriggerPolicy {
  /// Fire once for the most recent missed slot and drop the rest.
  #[default]
  Skip,
  /// Fire once for every missed slot, back to back.
  Backfill,
}
