use std::time::Duration;

use serde_json::Value;
use weft_config::ActivityOptions;
use weft_history::{InstanceId, ParentClosePolicy};

/// An intent produced by workflow logic during one scheduler pass.
///
/// Commands are ephemeral: the engine acknowledges each one by appending the
/// matching event, which removes it from the scheduler's buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
  ScheduleActivity {
    seq: u64,
    activity_type: String,
    input: Value,
    options: Option<ActivityOptions>,
  },
  StartTimer {
    seq: u64,
    duration: Duration,
  },
  StartChildWorkflow {
    seq: u64,
    workflow_type: String,
    /// Identity the child will run under, fixed when the command is issued.
    child: InstanceId,
    input: Value,
    parent_close_policy: ParentClosePolicy,
    execution_timeout: Option<Duration>,
  },
  CancelChildWorkflow {
    child_seq: u64,
    child: InstanceId,
  },
  CompleteWorkflow {
    result: Value,
  },
  FailWorkflow {
    message: String,
  },
  CancelWorkflow,
}

impl Command {
  pub fn name(&self) -> &'static str {
    match self {
      Command::ScheduleActivity { .. } => "schedule_activity",
      Command::StartTimer { .. } => "start_timer",
      Command::StartChildWorkflow { .. } => "start_child_workflow",
      Command::CancelChildWorkflow { .. } => "cancel_child_workflow",
      Command::CompleteWorkflow { .. } => "complete_workflow",
      Command::FailWorkflow { .. } => "fail_workflow",
      Command::CancelWorkflow => "cancel_workflow",
    }
  }

  /// Whether acknowledging this command ends the run.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      Command::CompleteWorkflow { .. } | Command::FailWorkflow { .. } | Command::CancelWorkflow
    )
  }
}
