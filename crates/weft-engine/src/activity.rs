//! Activity execution collaborator.
//!
//! Activities are the non-deterministic side of a workflow: the engine hands
//! each scheduled activity to an [`ActivityExecutor`] and records whatever
//! it returns as an `ActivityCompleted` or `ActivityFailed` event.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use weft_config::ActivityOptions;
use weft_history::InstanceId;

/// One activity invocation as handed to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRequest {
  pub instance: InstanceId,
  pub seq: u64,
  pub activity_type: String,
  pub input: Value,
  pub options: ActivityOptions,
}

/// Why an activity did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActivityFailure {
  #[error("unknown activity type '{0}'")]
  UnknownType(String),

  #[error("activity timed out after {0:?}")]
  Timeout(Duration),

  #[error("activity cancelled")]
  Cancelled,

  #[error("{0}")]
  Failed(String),
}

/// Executes activities on behalf of the engine.
///
/// Implementations own timeout and retry handling and return only once the
/// activity has succeeded or exhausted its retries.
#[async_trait]
pub trait ActivityExecutor: Send + Sync {
  async fn execute(
    &self,
    request: ActivityRequest,
    cancel: CancellationToken,
  ) -> Result<Value, ActivityFailure>;
}

type ActivityFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// In-process activity executor backed by async closures.
#[derive(Default, Clone)]
pub struct ActivityWorker {
  activities: HashMap<String, ActivityFn>,
}

impl ActivityWorker {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an activity implementation under `activity_type`.
  pub fn register<F, Fut>(&mut self, activity_type: impl Into<String>, func: F) -> &mut Self
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
  {
    let func: ActivityFn = Arc::new(move |input| Box::pin(func(input)));
    self.activities.insert(activity_type.into(), func);
    self
  }

  pub fn contains(&self, activity_type: &str) -> bool {
    self.activities.contains_key(activity_type)
  }
}

#[async_trait]
impl ActivityExecutor for ActivityWorker {
  #[instrument(
    name = "activity_execute",
    skip(self, request, cancel),
    fields(
      workflow_id = %request.instance.workflow_id,
      run_id = %request.instance.run_id,
      activity_type = %request.activity_type,
      seq = request.seq,
    )
  )]
  async fn execute(
    &self,
    request: ActivityRequest,
    cancel: CancellationToken,
  ) -> Result<Value, ActivityFailure> {
    let func = self
      .activities
      .get(&request.activity_type)
      .cloned()
      .ok_or_else(|| ActivityFailure::UnknownType(request.activity_type.clone()))?;

    let timeout = request.options.start_to_close_timeout();
    let retry = &request.options.retry;
    let mut attempt = 1;

    loop {
      let outcome = tokio::select! {
        _ = cancel.cancelled() => return Err(ActivityFailure::Cancelled),
        result = tokio::time::timeout(timeout, func(request.input.clone())) => match result {
          Ok(Ok(value)) => Ok(value),
          Ok(Err(message)) => Err(ActivityFailure::Failed(message)),
          Err(_) => Err(ActivityFailure::Timeout(timeout)),
        },
      };

      match outcome {
        Ok(value) => {
          info!(attempt, "activity_completed");
          return Ok(value);
        }
        Err(failure) if attempt < retry.attempts() => {
          attempt += 1;
          let delay = retry.delay_before(attempt);
          warn!(attempt, error = %failure, delay_ms = delay.as_millis() as u64, "activity_retrying");
          tokio::select! {
            _ = cancel.cancelled() => return Err(ActivityFailure::Cancelled),
            _ = tokio::time::sleep(delay) => {}
          }
        }
        Err(failure) => {
          warn!(attempt, error = %failure, "activity_failed");
          return Err(failure);
        }
      }
    }
  }
}
