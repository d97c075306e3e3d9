//! Outbound work queue.
//!
//! Everything an instance asks the outside world to do (run an activity, fire
//! a timer, start or cancel a child, report to a parent) is queued as an
//! [`Outbound`] message while the instance lock is held and handled here
//! after it is released. Results come back through the engine's inbound
//! methods, so an instance never waits on another instance's lock.

use std::sync::Weak;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use weft_history::{InstanceId, ParentRef};
use weft_workflow::{PendingChild, WorkflowOutcome};

use crate::activity::ActivityRequest;
use crate::engine::{Engine, EngineInner};
use crate::error::EngineError;

/// A unit of work handed to the dispatcher.
#[derive(Debug)]
pub(crate) enum Outbound {
  Activity {
    request: ActivityRequest,
    cancel: CancellationToken,
  },
  Timer {
    instance: InstanceId,
    seq: u64,
    fire_at: DateTime<Utc>,
  },
  StartChild {
    parent: ParentRef,
    namespace: String,
    child: PendingChild,
  },
  CancelChild {
    child: InstanceId,
    reason: String,
  },
  TerminateChild {
    child: InstanceId,
  },
  ReportToParent {
    parent: ParentRef,
    child: InstanceId,
    outcome: WorkflowOutcome,
  },
  ExecutionTimeout {
    instance: InstanceId,
    deadline: DateTime<Utc>,
  },
  CancelGrace {
    instance: InstanceId,
    deadline: DateTime<Utc>,
  },
}

impl Outbound {
  fn name(&self) -> &'static str {
    match self {
      Outbound::Activity { .. } => "activity",
      Outbound::Timer { .. } => "timer",
      Outbound::StartChild { .. } => "start_child",
      Outbound::CancelChild { .. } => "cancel_child",
      Outbound::TerminateChild { .. } => "terminate_child",
      Outbound::ReportToParent { .. } => "report_to_parent",
      Outbound::ExecutionTimeout { .. } => "execution_timeout",
      Outbound::CancelGrace { .. } => "cancel_grace",
    }
  }
}

/// Receives outbound messages and spawns a task per message.
///
/// Holds the engine weakly: the loop ends once every [`Engine`] handle is
/// dropped and the channel closes.
pub(crate) struct Dispatcher {
  engine: Weak<EngineInner>,
  receiver: mpsc::Receiver<Outbound>,
}

impl Dispatcher {
  pub(crate) fn new(engine: Weak<EngineInner>, receiver: mpsc::Receiver<Outbound>) -> Self {
    Self { engine, receiver }
  }

  /// Run until `cancel` fires or the channel closes.
  ///
  /// Stopping the loop also stops in-flight activities and timers; their
  /// outcomes are not recorded, so a later engine picks them up on recovery.
  pub(crate) async fn run(mut self, cancel: CancellationToken) {
    info!("dispatcher_started");

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("dispatcher_cancelled");
          break;
        }
        message = self.receiver.recv() => {
          match message {
            Some(message) => {
              let Some(inner) = self.engine.upgrade() else {
                break;
              };
              let engine = Engine { inner };
              tokio::spawn(engine.dispatch(message));
            }
            None => {
              info!("dispatcher_channel_closed");
              break;
            }
          }
        }
      }
    }

    if let Some(inner) = self.engine.upgrade() {
      inner.shutdown.cancel();
    }
  }
}

impl Engine {
  /// Handle one outbound message to completion.
  pub(crate) async fn dispatch(self, message: Outbound) {
    let name = message.name();
    debug!(message = name, "dispatching");

    let result = match message {
      Outbound::Activity { request, cancel } => self.run_activity(request, cancel).await,
      Outbound::Timer {
        instance,
        seq,
        fire_at,
      } => {
        if self.sleep_until(fire_at).await {
          self.fire_timer(&instance, seq).await
        } else {
          Ok(())
        }
      }
      Outbound::StartChild {
        parent,
        namespace,
        child,
      } => self.start_child(parent, namespace, child).await,
      Outbound::CancelChild { child, reason } => {
        ignore_gone(self.request_cancel(&child, &reason).await)
      }
      Outbound::TerminateChild { child } => ignore_gone(self.terminate(&child).await),
      Outbound::ReportToParent {
        parent,
        child,
        outcome,
      } => self.child_finished(parent, child, outcome).await,
      Outbound::ExecutionTimeout { instance, deadline } => {
        if self.sleep_until(deadline).await {
          ignore_gone(self.time_out(&instance).await)
        } else {
          Ok(())
        }
      }
      Outbound::CancelGrace { instance, deadline } => {
        if self.sleep_until(deadline).await {
          ignore_gone(self.grace_expired(&instance).await)
        } else {
          Ok(())
        }
      }
    };

    if let Err(e) = result {
      error!(message = name, error = %e, "dispatch_failed");
    }
  }

  async fn run_activity(
    &self,
    request: ActivityRequest,
    cancel: CancellationToken,
  ) -> Result<(), EngineError> {
    let instance = request.instance.clone();
    let seq = request.seq;
    let result = self.inner.activities.execute(request, cancel).await;

    // Stopped by shutdown rather than by the workflow: leave it outstanding.
    if self.inner.shutdown.is_cancelled() {
      return Ok(());
    }
    self.complete_activity(&instance, seq, result).await
  }

  /// Sleep until `deadline`. Returns false if the engine shut down first.
  async fn sleep_until(&self, deadline: DateTime<Utc>) -> bool {
    let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::select! {
      _ = self.inner.shutdown.cancelled() => false,
      _ = tokio::time::sleep(remaining) => true,
    }
  }
}

/// A message aimed at a run that is gone or finished is not a failure.
fn ignore_gone(result: Result<(), EngineError>) -> Result<(), EngineError> {
  match result {
    Err(EngineError::NotFound(_) | EngineError::Terminal(_)) => Ok(()),
    other => other,
  }
}
