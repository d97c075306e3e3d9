//! A resident workflow run and the lock that serializes everything done to it.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use weft_history::InstanceId;
use weft_workflow::{Scheduler, WorkflowOutcome};

use crate::dispatcher::Outbound;
use crate::error::EngineError;

/// In-memory state of one run. Only ever touched under its [`Resident`] lock.
pub(crate) struct Instance {
  pub(crate) scheduler: Scheduler,
  pub(crate) outcome_tx: watch::Sender<Option<WorkflowOutcome>>,
  /// Handed to activities. Replaced when a cancel request arrives so that
  /// work scheduled afterwards is not cancelled along with it.
  pub(crate) cancel: CancellationToken,
  /// Outbound work produced while the lock is held, sent after release.
  pub(crate) outbox: Vec<Outbound>,
  /// Set once replay diverged from history.
  pub(crate) broken: Option<String>,
  pub(crate) warned: bool,
}

impl Instance {
  pub(crate) fn new(scheduler: Scheduler, cancel: CancellationToken) -> Self {
    let (outcome_tx, _) = watch::channel(scheduler.outcome().cloned());
    Self {
      scheduler,
      outcome_tx,
      cancel,
      outbox: Vec::new(),
      broken: None,
      warned: false,
    }
  }

  pub(crate) fn id(&self) -> &InstanceId {
    self.scheduler.instance()
  }

  pub(crate) fn is_terminal(&self) -> bool {
    self.scheduler.status().is_terminal()
  }

  /// Fails unless the run can still be replayed.
  pub(crate) fn ensure_replayable(&self) -> Result<(), EngineError> {
    match &self.broken {
      Some(message) => Err(EngineError::NonDeterminism {
        instance: self.id().clone(),
        message: message.clone(),
      }),
      None => Ok(()),
    }
  }

  /// Fails unless the run can accept new inbound events.
  pub(crate) fn ensure_live(&self) -> Result<(), EngineError> {
    self.ensure_replayable()?;
    if self.is_terminal() {
      return Err(EngineError::Terminal(self.id().clone()));
    }
    Ok(())
  }

  pub(crate) fn take_outbox(&mut self) -> Vec<Outbound> {
    std::mem::take(&mut self.outbox)
  }

  /// Wrap for the instance map.
  pub(crate) fn into_resident(self) -> Resident {
    let outcome = self.outcome_tx.subscribe();
    Resident {
      instance: Arc::new(Mutex::new(self)),
      outcome,
    }
  }
}

/// Map entry for a resident run.
#[derive(Clone)]
pub(crate) struct Resident {
  pub(crate) instance: Arc<Mutex<Instance>>,
  /// Terminal outcome, readable without taking the lock.
  pub(crate) outcome: watch::Receiver<Option<WorkflowOutcome>>,
}

impl Resident {
  pub(crate) fn is_terminal(&self) -> bool {
    self.outcome.borrow().is_some()
  }
}
