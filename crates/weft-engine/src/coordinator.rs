//! Parent/child coordination.
//!
//! A parent's start-child command is authorized while the parent's lock is
//! held; the child itself is created later by the dispatcher. Children
//! report their terminal outcome back by id, and a parent's close policy is
//! applied to whatever children are still open when it finishes.

use tracing::{debug, error, info, warn};
use weft_history::{EventKind, InstanceId, ParentClosePolicy, ParentRef};
use weft_workflow::{PendingChild, WorkflowOutcome};

use crate::dispatcher::Outbound;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::instance::Instance;

impl Engine {
  /// Decide how a start-child command is recorded.
  pub(crate) fn admit_child(
    &self,
    inst: &Instance,
    seq: u64,
    workflow_type: String,
    child: InstanceId,
    parent_close_policy: ParentClosePolicy,
  ) -> EventKind {
    let parent_type = inst
      .scheduler
      .start_info()
      .map(|start| start.workflow_type.as_str());

    let rejected = match self.inner.workflows.authorize_start(&workflow_type, parent_type) {
      Err(e) => Some(e.to_string()),
      Ok(_) if self.is_running(&child.workflow_id) => Some(
        EngineError::AlreadyStarted {
          workflow_id: child.workflow_id.clone(),
        }
        .to_string(),
      ),
      Ok(_) => None,
    };

    match rejected {
      Some(reason) => {
        warn!(
          workflow_id = %inst.id().workflow_id,
          seq,
          child_type = workflow_type,
          reason,
          "child_start_rejected"
        );
        EventKind::ChildWorkflowStartFailed { seq, reason }
      }
      None => EventKind::ChildWorkflowStarted {
        seq,
        child,
        workflow_type,
        parent_close_policy,
      },
    }
  }

  /// Queue creation of the child recorded at `seq`.
  pub(crate) fn child_started(&self, inst: &mut Instance, seq: u64) {
    let (Some(start), Some(child)) = (inst.scheduler.start_info(), inst.scheduler.open_child(seq))
    else {
      return;
    };
    let message = Outbound::StartChild {
      parent: ParentRef {
        instance: inst.id().clone(),
        workflow_type: start.workflow_type.clone(),
        seq,
      },
      namespace: start.namespace.clone(),
      child: child.clone(),
    };
    inst.outbox.push(message);
  }

  /// Create a child run. Idempotent: a child that already has history is
  /// only reported back if it has finished.
  ///
  /// Runs under the parent's lock so the parent cannot close in between and
  /// miss applying its close policy to the new child.
  pub(crate) async fn start_child(
    &self,
    parent: ParentRef,
    namespace: String,
    child: PendingChild,
  ) -> Result<(), EngineError> {
    let id = child.child.clone();
    let handle = match self.instance(&parent.instance).await {
      Ok(handle) => handle,
      Err(EngineError::NotFound(_)) => return Ok(()),
      Err(e) => return Err(e),
    };
    let parent_inst = handle.lock().await;

    let wanted = parent_inst
      .scheduler
      .open_child(parent.seq)
      .is_some_and(|pending| pending.child == id)
      && (!parent_inst.is_terminal() || child.parent_close_policy == ParentClosePolicy::Abandon);
    if !wanted {
      debug!(parent = %parent.instance, child = %id, "child_start_skipped");
      return Ok(());
    }

    if self.inner.log.last_sequence(&id).await? > 0 {
      drop(parent_inst);
      let handle = self.instance(&id).await?;
      let outcome = handle.lock().await.scheduler.outcome().cloned();
      if let Some(outcome) = outcome {
        return self.child_finished(parent, id, outcome).await;
      }
      return Ok(());
    }

    let outcome = match self.inner.workflows.get(&child.workflow_type) {
      Some(workflow) => {
        let started = EventKind::WorkflowStarted {
          workflow_type: child.workflow_type.clone(),
          namespace,
          input: child.input,
          parent: Some(parent.clone()),
          parent_close_policy: child.parent_close_policy,
          execution_timeout_ms: child.execution_timeout.map(|t| t.as_millis() as u64),
        };
        match self.create(id.clone(), workflow, started).await {
          Ok(()) => {
            info!(
              parent = %parent.instance,
              workflow_id = %id.workflow_id,
              run_id = %id.run_id,
              workflow_type = child.workflow_type,
              "child_started"
            );
            return Ok(());
          }
          Err(e) => {
            error!(parent = %parent.instance, child = %id, error = %e, "child_start_failed");
            e.to_string()
          }
        }
      }
      None => EngineError::UnknownWorkflowType(child.workflow_type).to_string(),
    };

    drop(parent_inst);
    self
      .child_finished(parent, id, WorkflowOutcome::Failed { message: outcome })
      .await
  }

  /// Deliver a child's terminal outcome to its parent.
  pub(crate) async fn child_finished(
    &self,
    parent: ParentRef,
    child: InstanceId,
    outcome: WorkflowOutcome,
  ) -> Result<(), EngineError> {
    let handle = match self.instance(&parent.instance).await {
      Ok(handle) => handle,
      Err(EngineError::NotFound(_)) => {
        debug!(parent = %parent.instance, child = %child, "parent_gone");
        return Ok(());
      }
      Err(e) => return Err(e),
    };
    let mut inst = handle.lock().await;

    let open = !inst.is_terminal()
      && inst
        .scheduler
        .open_child(parent.seq)
        .is_some_and(|pending| pending.child == child);
    let result = if open {
      let kind = match outcome.into_result() {
        Ok(result) => EventKind::ChildWorkflowCompleted {
          seq: parent.seq,
          result,
        },
        Err(message) => EventKind::ChildWorkflowFailed {
          seq: parent.seq,
          message,
        },
      };
      self.deliver(&mut inst, kind).await
    } else {
      debug!(parent = %parent.instance, child = %child, "child_report_discarded");
      Ok(())
    };
    self.release(inst).await;
    result
  }

  /// Report a finished run to its parent and apply its close policy to the
  /// children it leaves behind. Safe to repeat.
  pub(crate) fn close_out(&self, inst: &mut Instance) {
    let Some(outcome) = inst.scheduler.outcome().cloned() else {
      return;
    };

    let mut messages = Vec::new();
    if let Some(parent) = inst.scheduler.start_info().and_then(|s| s.parent.clone()) {
      messages.push(Outbound::ReportToParent {
        parent,
        child: inst.id().clone(),
        outcome,
      });
    }

    for (seq, pending) in inst.scheduler.open_children() {
      let child = pending.child.clone();
      match pending.parent_close_policy {
        ParentClosePolicy::Terminate => messages.push(Outbound::TerminateChild { child }),
        ParentClosePolicy::RequestCancel => messages.push(Outbound::CancelChild {
          child,
          reason: "parent closed".to_string(),
        }),
        ParentClosePolicy::Abandon => {
          debug!(seq, child = %child, "child_abandoned");
        }
      }
    }

    inst.outbox.extend(messages);
  }
}
