//! Scheduler, handler and workflow errors.

use serde::{Deserialize, Serialize};

use crate::handler::HandlerKind;

/// Failure observed by workflow logic, or returned by it to fail the run.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum WorkflowError {
  /// Application-level failure raised by workflow logic.
  #[error("{0}")]
  Failed(String),

  /// The workflow observed a cancel request and unwound.
  #[error("workflow cancelled")]
  Cancelled,

  /// An activity exhausted its retries.
  #[error("activity '{activity_type}' failed: {message}")]
  ActivityFailed {
    activity_type: String,
    message: String,
  },

  /// A child run ended in anything other than completion.
  #[error("child workflow '{workflow_type}' failed: {message}")]
  ChildFailed {
    workflow_type: String,
    message: String,
  },

  /// The child could not be started (e.g. private workflow, wrong parent).
  #[error("child workflow start rejected: {reason}")]
  ChildStartRejected { reason: String },

  /// A payload did not have the expected shape.
  #[error("invalid payload: {0}")]
  Payload(String),
}

impl WorkflowError {
  pub fn failed(message: impl Into<String>) -> Self {
    WorkflowError::Failed(message.into())
  }
}

impl From<serde_json::Error> for WorkflowError {
  fn from(e: serde_json::Error) -> Self {
    WorkflowError::Payload(e.to_string())
  }
}

impl From<HandlerError> for WorkflowError {
  fn from(e: HandlerError) -> Self {
    WorkflowError::Failed(e.to_string())
  }
}

/// Errors from handler registration and dispatch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
  /// A handler with this name and kind is already registered on the instance.
  #[error("duplicate {kind} handler '{name}'")]
  Duplicate { name: String, kind: HandlerKind },

  /// No handler with this name and kind is registered.
  #[error("unknown {kind} '{name}'")]
  Unknown { name: String, kind: HandlerKind },

  /// The handler ran and returned an error.
  #[error("{0}")]
  Failed(String),
}

/// Errors raised while applying history to a scheduler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
  /// Replay diverged from the recorded history. Fatal for the instance.
  #[error("non-determinism at event {sequence}: {message}")]
  NonDeterminism { sequence: u64, message: String },

  /// The event does not directly follow the last applied one.
  #[error("event {sequence} applied out of order (last applied {last})")]
  OutOfOrder { sequence: u64, last: u64 },

  /// The history does not begin with a `WorkflowStarted` event.
  #[error("history does not start with workflow_started")]
  MissingStart,

  /// An event arrived after the run ended.
  #[error("event {sequence} applied after the run ended")]
  AlreadyTerminal { sequence: u64 },
}
