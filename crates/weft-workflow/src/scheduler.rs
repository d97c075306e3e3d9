//! Deterministic scheduler for a single workflow instance.
//!
//! The scheduler owns the workflow logic's future and drives it one pass at
//! a time. Every event, replayed or freshly appended, goes through
//! [`Scheduler::apply`]; the scheduler never performs I/O itself. Commands
//! produced by a pass wait in a buffer until the engine acknowledges each of
//! them with the matching event.
//!
//! Replay and live execution are the same code path: a replayed command
//! event consumes the command the re-executed logic just produced, and any
//! mismatch is reported as [`SchedulerError::NonDeterminism`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error};
use weft_config::ActivityOptions;
use weft_history::{Event, EventKind, InstanceId, ParentClosePolicy, ParentRef, UpdateOutcome};

use crate::command::Command;
use crate::context::WorkflowContext;
use crate::error::{HandlerError, SchedulerError, WorkflowError};
use crate::status::{InstanceStatus, WorkflowOutcome};
use crate::workflow::{Workflow, WorkflowFuture};

/// How the run was started, from its `WorkflowStarted` event.
#[derive(Debug, Clone)]
pub struct StartInfo {
  pub workflow_type: String,
  pub namespace: String,
  pub input: Value,
  pub parent: Option<ParentRef>,
  pub parent_close_policy: ParentClosePolicy,
  pub execution_timeout: Option<Duration>,
  pub started_at: DateTime<Utc>,
}

/// An activity recorded as scheduled with no result yet.
#[derive(Debug, Clone)]
pub struct PendingActivity {
  pub activity_type: String,
  pub input: Value,
  pub options: Option<ActivityOptions>,
}

/// A child recorded as started that has not reported back.
#[derive(Debug, Clone)]
pub struct PendingChild {
  pub child: InstanceId,
  pub workflow_type: String,
  pub input: Value,
  pub parent_close_policy: ParentClosePolicy,
  pub execution_timeout: Option<Duration>,
}

pub struct Scheduler {
  instance: InstanceId,
  workflow: Arc<dyn Workflow>,
  ctx: WorkflowContext,
  future: Option<WorkflowFuture>,
  last_sequence: u64,
  status: InstanceStatus,
  outcome: Option<WorkflowOutcome>,
  start: Option<StartInfo>,
  activities: BTreeMap<u64, PendingActivity>,
  timers: BTreeMap<u64, DateTime<Utc>>,
  children: BTreeMap<u64, PendingChild>,
  pending_updates: Vec<(String, UpdateOutcome)>,
}

impl Scheduler {
  pub fn new(instance: InstanceId, workflow: Arc<dyn Workflow>) -> Self {
    let ctx = WorkflowContext::new(instance.clone());
    Self {
      instance,
      workflow,
      ctx,
      future: None,
      last_sequence: 0,
      status: InstanceStatus::Created,
      outcome: None,
      start: None,
      activities: BTreeMap::new(),
      timers: BTreeMap::new(),
      children: BTreeMap::new(),
      pending_updates: Vec::new(),
    }
  }

  /// Rebuild an instance from its recorded history.
  pub fn replay<'a>(
    instance: InstanceId,
    workflow: Arc<dyn Workflow>,
    events: impl IntoIterator<Item = &'a Event>,
  ) -> Result<Self, SchedulerError> {
    let mut scheduler = Self::new(instance, workflow);
    scheduler.set_replaying(true);
    for event in events {
      scheduler.apply(event)?;
    }
    scheduler.set_replaying(false);
    Ok(scheduler)
  }

  pub fn instance(&self) -> &InstanceId {
    &self.instance
  }

  pub fn status(&self) -> InstanceStatus {
    self.status
  }

  pub fn outcome(&self) -> Option<&WorkflowOutcome> {
    self.outcome.as_ref()
  }

  /// Sequence number of the last applied event (0 before the first).
  pub fn last_sequence(&self) -> u64 {
    self.last_sequence
  }

  pub fn start_info(&self) -> Option<&StartInfo> {
    self.start.as_ref()
  }

  pub fn is_cancel_requested(&self) -> bool {
    self.ctx.is_cancel_requested()
  }

  pub fn set_replaying(&mut self, replaying: bool) {
    self.ctx.set_replaying(replaying);
  }

  /// The oldest unacknowledged command.
  pub fn next_command(&self) -> Option<Command> {
    self.ctx.front_command()
  }

  /// The current handler-visible state.
  pub fn state_snapshot(&self) -> Value {
    self.ctx.snapshot()
  }

  /// Run the validation phase of an update against the current state.
  pub fn validate_update(&self, name: &str, payload: &Value) -> Result<(), String> {
    self.ctx.validate_update(name, payload)
  }

  /// Outcome of an accepted update whose completion is not yet recorded.
  pub fn pending_update_outcome(&self, update_id: &str) -> Option<UpdateOutcome> {
    self
      .pending_updates
      .iter()
      .find(|(id, _)| id == update_id)
      .map(|(_, outcome)| outcome.clone())
  }

  /// Every accepted update still waiting for its `UpdateCompleted`.
  pub fn pending_updates(&self) -> &[(String, UpdateOutcome)] {
    &self.pending_updates
  }

  /// Answer a query from current state. Never appends or polls.
  pub fn query(&self, name: &str, args: &Value) -> Result<Value, HandlerError> {
    self.ctx.query(name, args)
  }

  pub fn outstanding_activities(&self) -> impl Iterator<Item = (u64, &PendingActivity)> {
    self.activities.iter().map(|(seq, a)| (*seq, a))
  }

  pub fn outstanding_timers(&self) -> impl Iterator<Item = (u64, DateTime<Utc>)> + '_ {
    self.timers.iter().map(|(seq, fire_at)| (*seq, *fire_at))
  }

  /// Children started by this run that have not reported completion.
  pub fn open_children(&self) -> impl Iterator<Item = (u64, &PendingChild)> {
    self.children.iter().map(|(seq, c)| (*seq, c))
  }

  pub fn is_activity_pending(&self, seq: u64) -> bool {
    self.activities.contains_key(&seq)
  }

  pub fn is_timer_pending(&self, seq: u64) -> bool {
    self.timers.contains_key(&seq)
  }

  pub fn open_child(&self, seq: u64) -> Option<&PendingChild> {
    self.children.get(&seq)
  }

  /// Apply the next event of this run's history.
  pub fn apply(&mut self, event: &Event) -> Result<(), SchedulerError> {
    if self.status.is_terminal() {
      return Err(SchedulerError::AlreadyTerminal {
        sequence: event.sequence,
      });
    }
    if event.sequence != self.last_sequence + 1 {
      return Err(SchedulerError::OutOfOrder {
        sequence: event.sequence,
        last: self.last_sequence,
      });
    }
    if self.last_sequence == 0 && !matches!(event.kind, EventKind::WorkflowStarted { .. }) {
      return Err(SchedulerError::MissingStart);
    }

    self.ctx.set_now(event.timestamp);
    let poll = self.apply_kind(event).inspect_err(|e| {
      error!(
        workflow_id = %self.instance.workflow_id,
        run_id = %self.instance.run_id,
        sequence = event.sequence,
        error = %e,
        "scheduler_apply_failed"
      );
    })?;
    self.last_sequence = event.sequence;

    if poll && !self.status.is_terminal() {
      self.poll();
    }
    Ok(())
  }

  /// Apply one event's effect. Returns whether the workflow should be polled.
  fn apply_kind(&mut self, event: &Event) -> Result<bool, SchedulerError> {
    let sequence = event.sequence;
    match &event.kind {
      EventKind::WorkflowStarted {
        workflow_type,
        namespace,
        input,
        parent,
        parent_close_policy,
        execution_timeout_ms,
      } => {
        if self.start.is_some() {
          return Err(nondeterminism(sequence, "workflow started twice"));
        }
        if workflow_type != self.workflow.workflow_type() {
          return Err(nondeterminism(
            sequence,
            format!(
              "history is for workflow type '{workflow_type}', replaying '{}'",
              self.workflow.workflow_type()
            ),
          ));
        }
        self.ctx.init(workflow_type, namespace, parent.clone());
        self.start = Some(StartInfo {
          workflow_type: workflow_type.clone(),
          namespace: namespace.clone(),
          input: input.clone(),
          parent: parent.clone(),
          parent_close_policy: *parent_close_policy,
          execution_timeout: execution_timeout_ms.map(Duration::from_millis),
          started_at: event.timestamp,
        });
        self.future = Some(self.workflow.run(self.ctx.clone(), input.clone()));
        self.status = InstanceStatus::Running;
        Ok(true)
      }

      EventKind::ActivityScheduled {
        seq,
        activity_type,
        input,
        options,
      } => {
        self.expect_command(event, |c| {
          matches!(c, Command::ScheduleActivity { seq: s, activity_type: t, .. } if s == seq && t == activity_type)
        })?;
        self.activities.insert(
          *seq,
          PendingActivity {
            activity_type: activity_type.clone(),
            input: input.clone(),
            options: options.clone(),
          },
        );
        Ok(true)
      }

      EventKind::ActivityCompleted { seq, result } => {
        self.expect_idle(event)?;
        self.take_activity(sequence, *seq)?;
        self.ctx.resolve(*seq, Ok(result.clone()));
        Ok(true)
      }

      EventKind::ActivityFailed { seq, message } => {
        self.expect_idle(event)?;
        let activity = self.take_activity(sequence, *seq)?;
        self.ctx.resolve(
          *seq,
          Err(WorkflowError::ActivityFailed {
            activity_type: activity.activity_type,
            message: message.clone(),
          }),
        );
        Ok(true)
      }

      EventKind::TimerStarted { seq, fire_at } => {
        self.expect_command(event, |c| matches!(c, Command::StartTimer { seq: s, .. } if s == seq))?;
        self.timers.insert(*seq, *fire_at);
        Ok(true)
      }

      EventKind::TimerFired { seq } => {
        self.expect_idle(event)?;
        if self.timers.remove(seq).is_none() {
          return Err(nondeterminism(sequence, format!("no timer started with seq {seq}")));
        }
        self.ctx.resolve(*seq, Ok(Value::Null));
        Ok(true)
      }

      EventKind::ChildWorkflowStarted {
        seq,
        child,
        workflow_type,
        parent_close_policy,
      } => {
        let command = self.expect_command(event, |c| {
          matches!(
            c,
            Command::StartChildWorkflow { seq: s, workflow_type: t, child: id, .. }
              if s == seq && t == workflow_type && id == child
          )
        })?;
        if let Command::StartChildWorkflow {
          input,
          execution_timeout,
          ..
        } = command
        {
          self.children.insert(
            *seq,
            PendingChild {
              child: child.clone(),
              workflow_type: workflow_type.clone(),
              input,
              parent_close_policy: *parent_close_policy,
              execution_timeout,
            },
          );
        }
        Ok(true)
      }

      EventKind::ChildWorkflowStartFailed { seq, reason } => {
        self.expect_command(event, |c| {
          matches!(c, Command::StartChildWorkflow { seq: s, .. } if s == seq)
        })?;
        self.ctx.resolve(
          *seq,
          Err(WorkflowError::ChildStartRejected {
            reason: reason.clone(),
          }),
        );
        Ok(true)
      }

      EventKind::ChildWorkflowCompleted { seq, result } => {
        self.expect_idle(event)?;
        self.take_child(sequence, *seq)?;
        self.ctx.resolve(*seq, Ok(result.clone()));
        Ok(true)
      }

      EventKind::ChildWorkflowFailed { seq, message } => {
        self.expect_idle(event)?;
        let child = self.take_child(sequence, *seq)?;
        self.ctx.resolve(
          *seq,
          Err(WorkflowError::ChildFailed {
            workflow_type: child.workflow_type,
            message: message.clone(),
          }),
        );
        Ok(true)
      }

      EventKind::ChildCancelRequested { seq, .. } => {
        self.expect_command(event, |c| {
          matches!(c, Command::CancelChildWorkflow { child_seq, .. } if child_seq == seq)
        })?;
        Ok(true)
      }

      EventKind::SignalReceived { name, payload } => {
        self.expect_idle(event)?;
        self.ctx.deliver_signal(name, payload.clone());
        Ok(true)
      }

      EventKind::UpdateAccepted {
        update_id,
        name,
        payload,
      } => {
        self.expect_idle(event)?;
        let outcome = self
          .ctx
          .apply_update(name, payload.clone())
          .ok_or_else(|| nondeterminism(sequence, format!("no update handler '{name}'")))?;
        self.pending_updates.push((update_id.clone(), outcome));
        // UpdateCompleted follows directly; the pass runs after it.
        Ok(false)
      }

      EventKind::UpdateRejected { .. } => {
        self.expect_idle(event)?;
        Ok(true)
      }

      EventKind::UpdateCompleted { update_id, outcome } => {
        self.expect_idle(event)?;
        let index = self
          .pending_updates
          .iter()
          .position(|(id, _)| id == update_id)
          .ok_or_else(|| nondeterminism(sequence, format!("update '{update_id}' was never accepted")))?;
        let (_, computed) = self.pending_updates.remove(index);
        if &computed != outcome {
          return Err(nondeterminism(
            sequence,
            format!("update '{update_id}' produced {computed:?}, history recorded {outcome:?}"),
          ));
        }
        Ok(true)
      }

      EventKind::CancelRequested { .. } => {
        self.expect_idle(event)?;
        self.ctx.request_cancel();
        Ok(true)
      }

      EventKind::WorkflowCompleted { result } => {
        self.expect_command(event, |c| matches!(c, Command::CompleteWorkflow { .. }))?;
        self.finish(WorkflowOutcome::Completed {
          result: result.clone(),
        });
        Ok(false)
      }

      EventKind::WorkflowFailed { message, forced } => {
        if !*forced {
          self.expect_command(event, |c| matches!(c, Command::FailWorkflow { .. }))?;
        }
        self.finish(WorkflowOutcome::Failed {
          message: message.clone(),
        });
        Ok(false)
      }

      EventKind::WorkflowCancelled { forced } => {
        if !*forced {
          self.expect_command(event, |c| matches!(c, Command::CancelWorkflow))?;
        }
        self.finish(WorkflowOutcome::Cancelled);
        Ok(false)
      }

      EventKind::WorkflowTimedOut => {
        self.finish(WorkflowOutcome::TimedOut);
        Ok(false)
      }
    }
  }

  /// Consume the head of the command buffer, which must match `event`.
  fn expect_command(
    &self,
    event: &Event,
    matches: impl FnOnce(&Command) -> bool,
  ) -> Result<Command, SchedulerError> {
    match self.ctx.front_command() {
      Some(command) if matches(&command) => {
        self.ctx.pop_command();
        Ok(command)
      }
      Some(command) => Err(nondeterminism(
        event.sequence,
        format!(
          "history recorded {} but workflow issued {}",
          event.kind.name(),
          command.name()
        ),
      )),
      None => Err(nondeterminism(
        event.sequence,
        format!(
          "history recorded {} but workflow issued no command",
          event.kind.name()
        ),
      )),
    }
  }

  /// Inbound events only arrive once every command has been acknowledged.
  fn expect_idle(&self, event: &Event) -> Result<(), SchedulerError> {
    match self.ctx.front_command() {
      Some(command) => Err(nondeterminism(
        event.sequence,
        format!(
          "workflow issued {} but history recorded {}",
          command.name(),
          event.kind.name()
        ),
      )),
      None => Ok(()),
    }
  }

  fn take_activity(&mut self, sequence: u64, seq: u64) -> Result<PendingActivity, SchedulerError> {
    self
      .activities
      .remove(&seq)
      .ok_or_else(|| nondeterminism(sequence, format!("no activity scheduled with seq {seq}")))
  }

  fn take_child(&mut self, sequence: u64, seq: u64) -> Result<PendingChild, SchedulerError> {
    self
      .children
      .remove(&seq)
      .ok_or_else(|| nondeterminism(sequence, format!("no child started with seq {seq}")))
  }

  fn finish(&mut self, outcome: WorkflowOutcome) {
    debug!(
      workflow_id = %self.instance.workflow_id,
      run_id = %self.instance.run_id,
      status = ?outcome.status(),
      "scheduler_finished"
    );
    self.status = outcome.status();
    self.outcome = Some(outcome);
    self.future = None;
    self.ctx.clear_commands();
  }

  /// One scheduler pass: poll the workflow logic until it suspends.
  fn poll(&mut self) {
    let Some(future) = self.future.as_mut() else {
      return;
    };
    self.status = InstanceStatus::Running;

    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    let polled = future.as_mut().poll(&mut cx);

    if let Some(message) = self.ctx.take_fatal() {
      self.future = None;
      self.ctx.clear_commands();
      self.ctx.push_command(Command::FailWorkflow { message });
      return;
    }

    match polled {
      Poll::Pending => {
        self.status = InstanceStatus::Suspended;
      }
      Poll::Ready(result) => {
        self.future = None;
        let command = match result {
          Ok(result) => Command::CompleteWorkflow { result },
          Err(WorkflowError::Cancelled) => Command::CancelWorkflow,
          Err(e) => Command::FailWorkflow {
            message: e.to_string(),
          },
        };
        self.ctx.push_command(command);
      }
    }

    if self.ctx.has_commands() {
      debug!(
        workflow_id = %self.instance.workflow_id,
        run_id = %self.instance.run_id,
        next = ?self.ctx.front_command().map(|c| c.name()),
        "scheduler_pass_produced_commands"
      );
    }
  }
}

fn nondeterminism(sequence: u64, message: impl Into<String>) -> SchedulerError {
  SchedulerError::NonDeterminism {
    sequence,
    message: message.into(),
  }
}
