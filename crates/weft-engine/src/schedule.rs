//! Recurring workflow starts.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use weft_config::MissedTriggerPolicy;

use crate::engine::{Engine, StartRequest, offset};

/// Starts a new run of a workflow type on a fixed interval.
///
/// Each run gets the workflow id `{schedule_id}-{unix_millis}` of its
/// scheduled tick, so ticks replayed after a stall keep distinct ids.
#[derive(Debug, Clone)]
pub struct ScheduleTrigger {
  pub schedule_id: String,
  pub workflow_type: String,
  pub input: Value,
  pub interval: Duration,
  pub missed: MissedTriggerPolicy,
}

impl ScheduleTrigger {
  pub fn new(
    schedule_id: impl Into<String>,
    workflow_type: impl Into<String>,
    interval: Duration,
  ) -> Self {
    Self {
      schedule_id: schedule_id.into(),
      workflow_type: workflow_type.into(),
      input: Value::Null,
      interval,
      missed: MissedTriggerPolicy::default(),
    }
  }

  pub fn input(mut self, input: Value) -> Self {
    self.input = input;
    self
  }

  /// What to do with ticks missed while the trigger was stalled.
  pub fn missed(mut self, missed: MissedTriggerPolicy) -> Self {
    self.missed = missed;
    self
  }

  /// Fire until `cancel` is triggered. The first tick fires immediately.
  /// A zero interval fires nothing and returns at once.
  pub async fn run(self, engine: Engine, cancel: CancellationToken) {
    if self.interval.is_zero() {
      warn!(schedule_id = %self.schedule_id, "schedule_interval_zero");
      return;
    }

    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(match self.missed {
      MissedTriggerPolicy::Skip => MissedTickBehavior::Skip,
      MissedTriggerPolicy::Backfill => MissedTickBehavior::Burst,
    });
    let origin = (Instant::now(), Utc::now());

    info!(
      schedule_id = %self.schedule_id,
      workflow_type = %self.workflow_type,
      interval_ms = self.interval.as_millis() as u64,
      "schedule_started"
    );

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!(schedule_id = %self.schedule_id, "schedule_cancelled");
          break;
        }
        tick = ticker.tick() => {
          let scheduled = offset(origin.1, tick.saturating_duration_since(origin.0));
          let workflow_id = format!("{}-{}", self.schedule_id, scheduled.timestamp_millis());
          let request = StartRequest::new(&workflow_id, &self.workflow_type, self.input.clone());

          match engine.start_workflow(request).await {
            Ok(id) => info!(schedule_id = %self.schedule_id, run_id = %id.run_id, workflow_id, "schedule_fired"),
            Err(e) => warn!(schedule_id = %self.schedule_id, workflow_id, error = %e, "schedule_start_failed"),
          }
        }
      }
    }
  }
}
