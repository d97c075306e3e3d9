use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use weft_config::ActivityOptions;

/// Identity of one workflow run.
///
/// `run_id` is assigned once when the run starts and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
  pub workflow_id: String,
  pub run_id: String,
}

impl InstanceId {
  pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
    Self {
      workflow_id: workflow_id.into(),
      run_id: run_id.into(),
    }
  }

  /// A new run of `workflow_id` with a freshly allocated run id.
  pub fn fresh(workflow_id: impl Into<String>) -> Self {
    Self::new(workflow_id, uuid::Uuid::new_v4().to_string())
  }
}

impl fmt::Display for InstanceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.workflow_id, self.run_id)
  }
}

/// What happens to a running child when its parent reaches a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentClosePolicy {
  /// Force-cancel the child.
  #[default]
  Terminate,
  /// Leave the child running on its own.
  Abandon,
  /// Deliver a cooperative cancel request to the child.
  RequestCancel,
}

/// Weak reference from a child run to the parent that started it.
///
/// Identity only: the parent is looked up by id when the child needs to
/// report back, never held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
  pub instance: InstanceId,
  pub workflow_type: String,
  /// Command sequence of the start in the parent's history.
  pub seq: u64,
}

/// Result of an accepted update's mutating handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
  Success(serde_json::Value),
  Failure(String),
}

/// One entry in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub sequence: u64,
  pub timestamp: DateTime<Utc>,
  #[serde(flatten)]
  pub kind: EventKind,
}

impl Event {
  pub fn new(sequence: u64, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
    Self {
      sequence,
      timestamp,
      kind,
    }
  }
}

/// Everything that can happen to a workflow run.
///
/// `seq` fields are the command sequence numbers allocated by the workflow
/// logic; they correlate a scheduled piece of work with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
  WorkflowStarted {
    workflow_type: String,
    namespace: String,
    input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<ParentRef>,
    #[serde(default)]
    parent_close_policy: ParentClosePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution_timeout_ms: Option<u64>,
  },
  ActivityScheduled {
    seq: u64,
    activity_type: String,
    input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<ActivityOptions>,
  },
  ActivityCompleted {
    seq: u64,
    result: serde_json::Value,
  },
  ActivityFailed {
    seq: u64,
    message: String,
  },
  TimerStarted {
    seq: u64,
    fire_at: DateTime<Utc>,
  },
  TimerFired {
    seq: u64,
  },
  ChildWorkflowStarted {
    seq: u64,
    child: InstanceId,
    workflow_type: String,
    parent_close_policy: ParentClosePolicy,
  },
  ChildWorkflowStartFailed {
    seq: u64,
    reason: String,
  },
  ChildWorkflowCompleted {
    seq: u64,
    result: serde_json::Value,
  },
  ChildWorkflowFailed {
    seq: u64,
    message: String,
  },
  ChildCancelRequested {
    seq: u64,
    child: InstanceId,
  },
  SignalReceived {
    name: String,
    payload: serde_json::Value,
  },
  UpdateAccepted {
    update_id: String,
    name: String,
    payload: serde_json::Value,
  },
  UpdateRejected {
    update_id: String,
    name: String,
    reason: String,
  },
  UpdateCompleted {
    update_id: String,
    outcome: UpdateOutcome,
  },
  CancelRequested {
    reason: String,
  },
  WorkflowCompleted {
    result: serde_json::Value,
  },
  WorkflowFailed {
    message: String,
    /// Recorded by the engine rather than returned by workflow logic.
    #[serde(default)]
    forced: bool,
  },
  WorkflowCancelled {
    #[serde(default)]
    forced: bool,
  },
  WorkflowTimedOut,
}

impl EventKind {
  /// Stable snake_case name, as stored in the `kind` column.
  pub fn name(&self) -> &'static str {
    match self {
      EventKind::WorkflowStarted { .. } => "workflow_started",
      EventKind::ActivityScheduled { .. } => "activity_scheduled",
      EventKind::ActivityCompleted { .. } => "activity_completed",
      EventKind::ActivityFailed { .. } => "activity_failed",
      EventKind::TimerStarted { .. } => "timer_started",
      EventKind::TimerFired { .. } => "timer_fired",
      EventKind::ChildWorkflowStarted { .. } => "child_workflow_started",
      EventKind::ChildWorkflowStartFailed { .. } => "child_workflow_start_failed",
      EventKind::ChildWorkflowCompleted { .. } => "child_workflow_completed",
      EventKind::ChildWorkflowFailed { .. } => "child_workflow_failed",
      EventKind::ChildCancelRequested { .. } => "child_cancel_requested",
      EventKind::SignalReceived { .. } => "signal_received",
      EventKind::UpdateAccepted { .. } => "update_accepted",
      EventKind::UpdateRejected { .. } => "update_rejected",
      EventKind::UpdateCompleted { .. } => "update_completed",
      EventKind::CancelRequested { .. } => "cancel_requested",
      EventKind::WorkflowCompleted { .. } => "workflow_completed",
      EventKind::WorkflowFailed { .. } => "workflow_failed",
      EventKind::WorkflowCancelled { .. } => "workflow_cancelled",
      EventKind::WorkflowTimedOut => "workflow_timed_out",
    }
  }

  /// Whether this event ends the run.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      EventKind::WorkflowCompleted { .. }
        | EventKind::WorkflowFailed { .. }
        | EventKind::WorkflowCancelled { .. }
        | EventKind::WorkflowTimedOut
    )
  }
}
