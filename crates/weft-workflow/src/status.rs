use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_history::EventKind;

/// Lifecycle status of a workflow instance.
///
/// `Created -> Running <-> Suspended -> {Completed | Failed | Cancelled | TimedOut}`.
/// Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
  Created,
  Running,
  Suspended,
  Completed,
  Failed,
  Cancelled,
  TimedOut,
}

impl InstanceStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      InstanceStatus::Completed
        | InstanceStatus::Failed
        | InstanceStatus::Cancelled
        | InstanceStatus::TimedOut
    )
  }
}

/// Final result of a run, as seen by anyone awaiting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowOutcome {
  Completed { result: Value },
  Failed { message: String },
  Cancelled,
  TimedOut,
}

impl WorkflowOutcome {
  /// The outcome recorded by a terminal event, if `kind` is one.
  pub fn from_event(kind: &EventKind) -> Option<Self> {
    match kind {
      EventKind::WorkflowCompleted { result } => Some(WorkflowOutcome::Completed {
        result: result.clone(),
      }),
      EventKind::WorkflowFailed { message, .. } => Some(WorkflowOutcome::Failed {
        message: message.clone(),
      }),
      EventKind::WorkflowCancelled { .. } => Some(WorkflowOutcome::Cancelled),
      EventKind::WorkflowTimedOut => Some(WorkflowOutcome::TimedOut),
      _ => None,
    }
  }

  pub fn status(&self) -> InstanceStatus {
    match self {
      WorkflowOutcome::Completed { .. } => InstanceStatus::Completed,
      WorkflowOutcome::Failed { .. } => InstanceStatus::Failed,
      WorkflowOutcome::Cancelled => InstanceStatus::Cancelled,
      WorkflowOutcome::TimedOut => InstanceStatus::TimedOut,
    }
  }

  /// How a child's outcome is reported to its parent: `Ok` only on completion.
  pub fn into_result(self) -> Result<Value, String> {
    match self {
      WorkflowOutcome::Completed { result } => Ok(result),
      WorkflowOutcome::Failed { message } => Err(message),
      WorkflowOutcome::Cancelled => Err("workflow cancelled".to_string()),
      WorkflowOutcome::TimedOut => Err("workflow timed out".to_string()),
    }
  }
}
