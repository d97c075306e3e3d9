use weft_history::InstanceId;
use weft_workflow::{SchedulerError, StartDenied};

/// Errors returned by the engine's inbound surface.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// A private workflow was started without an authorized parent.
  #[error("unauthorized start: {reason}")]
  UnauthorizedStart { reason: String },

  /// The update's validation phase rejected it. Recorded as `UpdateRejected`.
  #[error("update rejected: {reason}")]
  Validation { reason: String },

  /// The update was accepted but its handler returned an error.
  #[error("update failed: {message}")]
  UpdateFailed { message: String },

  /// Replay diverged from history. The instance is unreplayable until fixed.
  #[error("non-determinism in {instance}: {message}")]
  NonDeterminism { instance: InstanceId, message: String },

  #[error("workflow instance not found: {0}")]
  NotFound(InstanceId),

  #[error("workflow '{workflow_id}' already has a running instance")]
  AlreadyStarted { workflow_id: String },

  #[error("unknown workflow type '{0}'")]
  UnknownWorkflowType(String),

  /// No query handler with that name.
  #[error("unknown {kind} '{name}'")]
  UnknownHandler { name: String, kind: String },

  /// A query handler returned an error.
  #[error("query '{name}' failed: {message}")]
  QueryFailed { name: String, message: String },

  /// The instance has already reached a terminal state.
  #[error("workflow instance {0} has already finished")]
  Terminal(InstanceId),

  /// The dispatcher was already started for this engine.
  #[error("engine dispatcher already running")]
  AlreadyRunning,

  /// The engine shut down while the call was waiting.
  #[error("engine shut down")]
  Shutdown,

  #[error("history error: {0}")]
  History(#[from] weft_history::Error),
}

impl EngineError {
  pub(crate) fn from_scheduler(instance: &InstanceId, e: SchedulerError) -> Self {
    EngineError::NonDeterminism {
      instance: instance.clone(),
      message: e.to_string(),
    }
  }

  pub(crate) fn is_retryable(&self) -> bool {
    matches!(self, EngineError::History(e) if e.is_retryable())
  }
}

impl From<StartDenied> for EngineError {
  fn from(e: StartDenied) -> Self {
    match e {
      StartDenied::UnknownType(workflow_type) => EngineError::UnknownWorkflowType(workflow_type),
      other => EngineError::UnauthorizedStart {
        reason: other.to_string(),
      },
    }
  }
}
