//! The instance manager.
//!
//! Owns the resident instances, admits every inbound event through the
//! instance's lock, appends it to the event log and applies it to the
//! scheduler. Commands the workflow emits in response are acknowledged by
//! appending their events, then handed to the dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde_json::Value;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use weft_config::EngineConfig;
use weft_history::{
  Event, EventKind, EventLog, InstanceId, MemoryEventLog, ParentClosePolicy, UpdateOutcome,
};
use weft_workflow::{
  Command, HandlerError, InstanceStatus, Scheduler, SchedulerError, Workflow, WorkflowOutcome,
  WorkflowRegistry,
};

use crate::activity::{ActivityExecutor, ActivityFailure, ActivityRequest, ActivityWorker};
use crate::dispatcher::{Dispatcher, Outbound};
use crate::error::EngineError;
use crate::instance::{Instance, Resident};

/// Message recorded when a run is failed for outgrowing its history.
pub const HISTORY_LIMIT_MESSAGE: &str = "history size limit exceeded";

/// A request to start a top-level workflow run.
#[derive(Debug, Clone)]
pub struct StartRequest {
  pub workflow_id: String,
  pub workflow_type: String,
  pub input: Value,
  pub namespace: String,
  pub execution_timeout: Option<std::time::Duration>,
}

impl StartRequest {
  pub fn new(
    workflow_id: impl Into<String>,
    workflow_type: impl Into<String>,
    input: Value,
  ) -> Self {
    Self {
      workflow_id: workflow_id.into(),
      workflow_type: workflow_type.into(),
      input,
      namespace: "default".to_string(),
      execution_timeout: None,
    }
  }

  pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = namespace.into();
    self
  }

  /// Time the run out if it has not finished within `timeout`.
  pub fn execution_timeout(mut self, timeout: std::time::Duration) -> Self {
    self.execution_timeout = Some(timeout);
    self
  }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
  config: EngineConfig,
  log: Option<Arc<dyn EventLog>>,
  workflows: WorkflowRegistry,
  activities: Option<Arc<dyn ActivityExecutor>>,
}

impl EngineBuilder {
  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  /// Event log to persist history to. Defaults to an in-memory log.
  pub fn event_log(mut self, log: Arc<dyn EventLog>) -> Self {
    self.log = Some(log);
    self
  }

  pub fn workflows(mut self, workflows: WorkflowRegistry) -> Self {
    self.workflows = workflows;
    self
  }

  pub fn activities(mut self, executor: impl ActivityExecutor + 'static) -> Self {
    self.activities = Some(Arc::new(executor));
    self
  }

  pub fn build(self) -> Engine {
    let (sender, receiver) = mpsc::channel(self.config.dispatcher_buffer.max(1));
    let inner = EngineInner {
      log: self
        .log
        .unwrap_or_else(|| Arc::new(MemoryEventLog::new()) as Arc<dyn EventLog>),
      workflows: self.workflows,
      activities: self
        .activities
        .unwrap_or_else(|| Arc::new(ActivityWorker::new()) as Arc<dyn ActivityExecutor>),
      config: self.config,
      instances: Mutex::new(HashMap::new()),
      sender,
      receiver: Mutex::new(Some(receiver)),
      shutdown: CancellationToken::new(),
    };
    Engine {
      inner: Arc::new(inner),
    }
  }
}

pub(crate) struct EngineInner {
  pub(crate) config: EngineConfig,
  pub(crate) log: Arc<dyn EventLog>,
  pub(crate) workflows: WorkflowRegistry,
  pub(crate) activities: Arc<dyn ActivityExecutor>,
  pub(crate) instances: Mutex<HashMap<InstanceId, Resident>>,
  pub(crate) sender: mpsc::Sender<Outbound>,
  pub(crate) receiver: Mutex<Option<mpsc::Receiver<Outbound>>>,
  /// Cancelled when the dispatcher stops; parents every activity token.
  pub(crate) shutdown: CancellationToken,
}

/// Durable workflow engine.
///
/// Cheap to clone; every clone drives the same set of instances.
///
/// # Usage
///
/// ```ignore
/// let engine = Engine::builder()
///     .event_log(Arc::new(SqliteEventLog::open("weft.db").await?))
///     .workflows(workflows)
///     .activities(worker)
///     .build();
///
/// let cancel = CancellationToken::new();
/// engine.start(cancel.clone())?;
/// engine.recover().await?;
///
/// let id = engine.start_workflow(StartRequest::new("order-7", "order", input)).await?;
/// engine.signal(&id, "approve", Value::Null).await?;
/// let outcome = engine.result(&id).await?;
/// ```
#[derive(Clone)]
pub struct Engine {
  pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
  pub fn builder() -> EngineBuilder {
    EngineBuilder {
      config: EngineConfig::default(),
      log: None,
      workflows: WorkflowRegistry::new(),
      activities: None,
    }
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  pub fn event_log(&self) -> &Arc<dyn EventLog> {
    &self.inner.log
  }

  /// Spawn the dispatcher loop. It runs until `cancel` fires or every
  /// engine handle is dropped.
  pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>, EngineError> {
    let receiver = self
      .inner
      .receiver
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
      .ok_or(EngineError::AlreadyRunning)?;
    let dispatcher = Dispatcher::new(Arc::downgrade(&self.inner), receiver);
    Ok(tokio::spawn(dispatcher.run(cancel)))
  }

  // ---------------------------------------------------------------------------
  // Inbound surface
  // ---------------------------------------------------------------------------

  /// Start a new top-level run.
  ///
  /// Private workflow types can only be started as children; starting one
  /// here fails with [`EngineError::UnauthorizedStart`] and records nothing.
  #[instrument(
    name = "start_workflow",
    skip(self, request),
    fields(workflow_id = %request.workflow_id, workflow_type = %request.workflow_type)
  )]
  pub async fn start_workflow(&self, request: StartRequest) -> Result<InstanceId, EngineError> {
    let workflow = self
      .inner
      .workflows
      .authorize_start(&request.workflow_type, None)
      .inspect_err(|e| warn!(error = %e, "start_rejected"))?;

    if self.is_running(&request.workflow_id) {
      return Err(EngineError::AlreadyStarted {
        workflow_id: request.workflow_id,
      });
    }

    let id = InstanceId::fresh(&request.workflow_id);
    let started = EventKind::WorkflowStarted {
      workflow_type: request.workflow_type,
      namespace: request.namespace,
      input: request.input,
      parent: None,
      parent_close_policy: ParentClosePolicy::default(),
      execution_timeout_ms: request.execution_timeout.map(|t| t.as_millis() as u64),
    };
    self.create(id.clone(), workflow, started).await?;
    Ok(id)
  }

  /// Deliver a signal. Returns once the signal is durably recorded.
  #[instrument(
    name = "signal",
    skip(self, payload),
    fields(workflow_id = %id.workflow_id, run_id = %id.run_id)
  )]
  pub async fn signal(&self, id: &InstanceId, name: &str, payload: Value) -> Result<(), EngineError> {
    let handle = self.instance(id).await?;
    let mut inst = handle.lock().await;
    let result = self.signal_locked(&mut inst, name, payload).await;
    self.release(inst).await;
    result
  }

  async fn signal_locked(
    &self,
    inst: &mut Instance,
    name: &str,
    payload: Value,
  ) -> Result<(), EngineError> {
    inst.ensure_live()?;
    self.settle(inst).await?;
    let event = self
      .append(
        inst,
        EventKind::SignalReceived {
          name: name.to_string(),
          payload,
        },
      )
      .await?;
    if event.kind.is_terminal() {
      return Err(EngineError::Terminal(inst.id().clone()));
    }
    info!(name, "signal_received");

    // The signal is durable; anything failing past this point surfaces on
    // the next event instead.
    if let Err(e) = self.drain(inst).await {
      warn!(error = %e, "drain_after_signal_failed");
    }
    Ok(())
  }

  /// Run an update: validate, record acceptance, apply the mutation, record
  /// its outcome. Returns the handler's result.
  #[instrument(
    name = "update",
    skip(self, payload),
    fields(workflow_id = %id.workflow_id, run_id = %id.run_id)
  )]
  pub async fn update(&self, id: &InstanceId, name: &str, payload: Value) -> Result<Value, EngineError> {
    let handle = self.instance(id).await?;
    let mut inst = handle.lock().await;
    let result = self.update_locked(&mut inst, name, payload).await;
    self.release(inst).await;
    result
  }

  async fn update_locked(
    &self,
    inst: &mut Instance,
    name: &str,
    payload: Value,
  ) -> Result<Value, EngineError> {
    inst.ensure_live()?;
    self.settle(inst).await?;

    let update_id = Uuid::new_v4().to_string();
    if let Err(reason) = inst.scheduler.validate_update(name, &payload) {
      self
        .append(
          inst,
          EventKind::UpdateRejected {
            update_id: update_id.clone(),
            name: name.to_string(),
            reason: reason.clone(),
          },
        )
        .await?;
      info!(update_id, name, reason, "update_rejected");
      self.drain(inst).await?;
      return Err(EngineError::Validation { reason });
    }

    self
      .append(
        inst,
        EventKind::UpdateAccepted {
          update_id: update_id.clone(),
          name: name.to_string(),
          payload,
        },
      )
      .await?;

    // A forced terminal event (history limit) can stand in for the accept.
    let outcome = inst
      .scheduler
      .pending_update_outcome(&update_id)
      .ok_or_else(|| EngineError::Terminal(inst.id().clone()))?;
    self.complete_update(inst, update_id, outcome.clone()).await?;
    self.drain(inst).await?;

    match outcome {
      UpdateOutcome::Success(value) => Ok(value),
      UpdateOutcome::Failure(message) => Err(EngineError::UpdateFailed { message }),
    }
  }

  /// Evaluate a query against the current state. Appends nothing.
  #[instrument(
    name = "query",
    skip(self, args),
    fields(workflow_id = %id.workflow_id, run_id = %id.run_id)
  )]
  pub async fn query(&self, id: &InstanceId, name: &str, args: Value) -> Result<Value, EngineError> {
    let handle = self.instance(id).await?;
    let inst = handle.lock().await;
    inst.ensure_replayable()?;
    inst.scheduler.query(name, &args).map_err(|e| match e {
      HandlerError::Unknown { name, kind } => EngineError::UnknownHandler {
        name,
        kind: kind.to_string(),
      },
      HandlerError::Failed(message) => EngineError::QueryFailed {
        name: name.to_string(),
        message,
      },
      other => EngineError::QueryFailed {
        name: name.to_string(),
        message: other.to_string(),
      },
    })
  }

  /// Ask the run to cancel. Its logic observes the request and may run
  /// compensation; a run still going after the grace period is cancelled
  /// forcibly. Repeated requests are no-ops.
  #[instrument(
    name = "request_cancel",
    skip(self),
    fields(workflow_id = %id.workflow_id, run_id = %id.run_id)
  )]
  pub async fn request_cancel(&self, id: &InstanceId, reason: &str) -> Result<(), EngineError> {
    let handle = self.instance(id).await?;
    let mut inst = handle.lock().await;
    let result = self.cancel_locked(&mut inst, reason).await;
    self.release(inst).await;
    result
  }

  async fn cancel_locked(&self, inst: &mut Instance, reason: &str) -> Result<(), EngineError> {
    inst.ensure_replayable()?;
    if inst.scheduler.is_cancel_requested() {
      debug!("cancel_already_requested");
      return Ok(());
    }
    inst.ensure_live()?;
    self.settle(inst).await?;
    self
      .append(
        inst,
        EventKind::CancelRequested {
          reason: reason.to_string(),
        },
      )
      .await?;
    info!(reason, "cancel_requested");

    let previous = std::mem::replace(&mut inst.cancel, self.inner.shutdown.child_token());
    previous.cancel();
    self.drain(inst).await?;

    if !inst.is_terminal() {
      let deadline = offset(Utc::now(), self.inner.config.cancellation_grace_period());
      inst.outbox.push(Outbound::CancelGrace {
        instance: inst.id().clone(),
        deadline,
      });
    }
    Ok(())
  }

  /// Cancel the run immediately without giving its logic a chance to react.
  #[instrument(
    name = "terminate",
    skip(self),
    fields(workflow_id = %id.workflow_id, run_id = %id.run_id)
  )]
  pub async fn terminate(&self, id: &InstanceId) -> Result<(), EngineError> {
    self
      .force(id, EventKind::WorkflowCancelled { forced: true })
      .await
  }

  /// Wait for the run to reach a terminal state.
  pub async fn result(&self, id: &InstanceId) -> Result<WorkflowOutcome, EngineError> {
    let handle = self.instance(id).await?;
    let mut outcome = handle.lock().await.outcome_tx.subscribe();
    drop(handle);

    let outcome = outcome
      .wait_for(Option::is_some)
      .await
      .map_err(|_| EngineError::Shutdown)?
      .clone();
    outcome.ok_or(EngineError::Shutdown)
  }

  pub async fn status(&self, id: &InstanceId) -> Result<InstanceStatus, EngineError> {
    let handle = self.instance(id).await?;
    let inst = handle.lock().await;
    inst.ensure_replayable()?;
    Ok(inst.scheduler.status())
  }

  /// Snapshot of the run's workflow state.
  pub async fn state(&self, id: &InstanceId) -> Result<Value, EngineError> {
    let handle = self.instance(id).await?;
    let inst = handle.lock().await;
    inst.ensure_replayable()?;
    Ok(inst.scheduler.state_snapshot())
  }

  /// The run's full recorded history.
  pub async fn history(&self, id: &InstanceId) -> Result<Vec<Event>, EngineError> {
    let events = self.inner.log.read_all(id).await?;
    if events.is_empty() {
      return Err(EngineError::NotFound(id.clone()));
    }
    Ok(events)
  }

  /// Load every run found in the event log, resuming outstanding work and
  /// completing anything interrupted by a crash. Returns the runs that are
  /// still in progress.
  #[instrument(name = "recover", skip(self))]
  pub async fn recover(&self) -> Result<Vec<InstanceId>, EngineError> {
    let mut running = Vec::new();

    for id in self.inner.log.instances().await? {
      if self.resident(&id).is_some() {
        continue;
      }
      let handle = match self.load(&id).await {
        Ok(handle) => handle,
        Err(e) => {
          error!(workflow_id = %id.workflow_id, run_id = %id.run_id, error = %e, "recover_failed");
          continue;
        }
      };

      let mut inst = handle.lock().await;
      if inst.is_terminal() {
        self.close_out(&mut inst);
      } else {
        running.push(id);
      }
      self.release(inst).await;
    }

    info!(running = running.len(), "recovered");
    Ok(running)
  }

  /// Number of runs currently held in memory.
  pub fn resident_count(&self) -> usize {
    self.instances().len()
  }

  /// Drop every finished run from memory. They are replayed again on demand.
  pub fn evict_terminal(&self) -> usize {
    let mut map = self.instances();
    let before = map.len();
    map.retain(|_, resident| !resident.is_terminal());
    before - map.len()
  }

  // ---------------------------------------------------------------------------
  // Events from collaborators
  // ---------------------------------------------------------------------------

  pub(crate) async fn complete_activity(
    &self,
    id: &InstanceId,
    seq: u64,
    result: Result<Value, ActivityFailure>,
  ) -> Result<(), EngineError> {
    let kind = match result {
      Ok(result) => EventKind::ActivityCompleted { seq, result },
      Err(e) => EventKind::ActivityFailed {
        seq,
        message: e.to_string(),
      },
    };
    let handle = self.instance(id).await?;
    let mut inst = handle.lock().await;
    let result = if inst.is_terminal() || !inst.scheduler.is_activity_pending(seq) {
      debug!(seq, "activity_result_discarded");
      Ok(())
    } else {
      self.deliver(&mut inst, kind).await
    };
    self.release(inst).await;
    result
  }

  pub(crate) async fn fire_timer(&self, id: &InstanceId, seq: u64) -> Result<(), EngineError> {
    let handle = self.instance(id).await?;
    let mut inst = handle.lock().await;
    let result = if inst.is_terminal() || !inst.scheduler.is_timer_pending(seq) {
      Ok(())
    } else {
      self.deliver(&mut inst, EventKind::TimerFired { seq }).await
    };
    self.release(inst).await;
    result
  }

  pub(crate) async fn time_out(&self, id: &InstanceId) -> Result<(), EngineError> {
    warn!(workflow_id = %id.workflow_id, run_id = %id.run_id, "execution_timeout");
    self.force(id, EventKind::WorkflowTimedOut).await
  }

  pub(crate) async fn grace_expired(&self, id: &InstanceId) -> Result<(), EngineError> {
    warn!(workflow_id = %id.workflow_id, run_id = %id.run_id, "cancel_grace_elapsed");
    self
      .force(id, EventKind::WorkflowCancelled { forced: true })
      .await
  }

  /// Record an engine-decided terminal event. A no-op on finished runs.
  async fn force(&self, id: &InstanceId, kind: EventKind) -> Result<(), EngineError> {
    let handle = self.instance(id).await?;
    let mut inst = handle.lock().await;
    let result = if inst.is_terminal() {
      Ok(())
    } else {
      match inst.ensure_replayable() {
        Ok(()) => self.append(&mut inst, kind).await.map(|_| ()),
        Err(e) => Err(e),
      }
    };
    self.release(inst).await;
    result
  }

  /// Append an inbound event to a live run and process what it triggers.
  pub(crate) async fn deliver(&self, inst: &mut Instance, kind: EventKind) -> Result<(), EngineError> {
    inst.ensure_live()?;
    self.settle(inst).await?;
    self.append(inst, kind).await?;
    self.drain(inst).await
  }

  // ---------------------------------------------------------------------------
  // Residency
  // ---------------------------------------------------------------------------

  pub(crate) fn instances(&self) -> MutexGuard<'_, HashMap<InstanceId, Resident>> {
    self
      .inner
      .instances
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn resident(&self, id: &InstanceId) -> Option<Resident> {
    self.instances().get(id).cloned()
  }

  /// Whether some run of `workflow_id` is resident and unfinished.
  pub(crate) fn is_running(&self, workflow_id: &str) -> bool {
    self
      .instances()
      .iter()
      .any(|(id, resident)| id.workflow_id == workflow_id && !resident.is_terminal())
  }

  /// The resident run, replaying it from history if it is not in memory.
  pub(crate) async fn instance(
    &self,
    id: &InstanceId,
  ) -> Result<Arc<tokio::sync::Mutex<Instance>>, EngineError> {
    if let Some(resident) = self.resident(id) {
      return Ok(resident.instance);
    }
    self.load(id).await
  }

  async fn load(&self, id: &InstanceId) -> Result<Arc<tokio::sync::Mutex<Instance>>, EngineError> {
    let events = self.inner.log.read_all(id).await?;
    let Some(first) = events.first() else {
      return Err(EngineError::NotFound(id.clone()));
    };
    let EventKind::WorkflowStarted { workflow_type, .. } = &first.kind else {
      return Err(EngineError::from_scheduler(id, SchedulerError::MissingStart));
    };
    let workflow = self
      .inner
      .workflows
      .get(workflow_type)
      .ok_or_else(|| EngineError::UnknownWorkflowType(workflow_type.clone()))?;

    let scheduler = Scheduler::replay(id.clone(), workflow, &events).map_err(|e| {
      let e = EngineError::from_scheduler(id, e);
      error!(workflow_id = %id.workflow_id, run_id = %id.run_id, error = %e, "replay_failed");
      e
    })?;
    debug!(
      workflow_id = %id.workflow_id,
      run_id = %id.run_id,
      events = events.len(),
      status = ?scheduler.status(),
      "workflow_replayed"
    );

    let resident = Instance::new(scheduler, self.inner.shutdown.child_token()).into_resident();
    let mut guard = Arc::clone(&resident.instance).lock_owned().await;
    {
      let mut map = self.instances();
      if let Some(existing) = map.get(id) {
        return Ok(Arc::clone(&existing.instance));
      }
      map.insert(id.clone(), resident.clone());
    }

    let result = self.resume(&mut guard).await;
    if let Err(e) = &result {
      warn!(workflow_id = %id.workflow_id, run_id = %id.run_id, error = %e, "resume_failed");
    }
    self.release(guard).await;
    Ok(resident.instance)
  }

  /// Record a brand-new run, resident from the first event on.
  pub(crate) async fn create(
    &self,
    id: InstanceId,
    workflow: Arc<dyn Workflow>,
    started: EventKind,
  ) -> Result<(), EngineError> {
    let scheduler = Scheduler::new(id.clone(), workflow);
    let resident = Instance::new(scheduler, self.inner.shutdown.child_token()).into_resident();
    let mut guard: OwnedMutexGuard<Instance> = Arc::clone(&resident.instance).lock_owned().await;
    self.instances().insert(id.clone(), resident);

    let result = self.begin(&mut guard, started).await;
    if result.is_err() && guard.scheduler.last_sequence() == 0 {
      self.instances().remove(&id);
    }
    self.release(guard).await;
    result
  }

  async fn begin(&self, inst: &mut Instance, started: EventKind) -> Result<(), EngineError> {
    self.append(inst, started).await?;
    info!(
      workflow_id = %inst.id().workflow_id,
      run_id = %inst.id().run_id,
      "workflow_started"
    );
    self.arm_execution_timeout(inst);
    self.drain(inst).await
  }

  /// Pick a freshly replayed run back up.
  async fn resume(&self, inst: &mut Instance) -> Result<(), EngineError> {
    if inst.is_terminal() {
      return Ok(());
    }
    match self.settle(inst).await {
      Err(EngineError::Terminal(_)) => return Ok(()),
      result => result?,
    }

    let id = inst.id().clone();
    let activities: Vec<Outbound> = inst
      .scheduler
      .outstanding_activities()
      .map(|(seq, activity)| Outbound::Activity {
        request: ActivityRequest {
          instance: id.clone(),
          seq,
          activity_type: activity.activity_type.clone(),
          input: activity.input.clone(),
          options: activity
            .options
            .clone()
            .unwrap_or_else(|| self.inner.config.activity.clone()),
        },
        cancel: inst.cancel.clone(),
      })
      .collect();
    let timers: Vec<Outbound> = inst
      .scheduler
      .outstanding_timers()
      .map(|(seq, fire_at)| Outbound::Timer {
        instance: id.clone(),
        seq,
        fire_at,
      })
      .collect();
    let children: Vec<u64> = inst.scheduler.open_children().map(|(seq, _)| seq).collect();

    inst.outbox.extend(activities);
    inst.outbox.extend(timers);
    for seq in children {
      self.child_started(inst, seq);
    }
    self.arm_execution_timeout(inst);
    if inst.scheduler.is_cancel_requested() {
      let deadline = offset(Utc::now(), self.inner.config.cancellation_grace_period());
      inst.outbox.push(Outbound::CancelGrace {
        instance: id.clone(),
        deadline,
      });
    }

    info!(
      workflow_id = %id.workflow_id,
      run_id = %id.run_id,
      outstanding = inst.outbox.len(),
      "workflow_resumed"
    );
    Ok(())
  }

  fn arm_execution_timeout(&self, inst: &mut Instance) {
    let Some(start) = inst.scheduler.start_info() else {
      return;
    };
    if let Some(timeout) = start.execution_timeout {
      let deadline = offset(start.started_at, timeout);
      inst.outbox.push(Outbound::ExecutionTimeout {
        instance: inst.id().clone(),
        deadline,
      });
    }
  }

  /// Send everything the run queued, after its lock is released.
  pub(crate) async fn release<G>(&self, mut guard: G)
  where
    G: std::ops::DerefMut<Target = Instance>,
  {
    let outbox = guard.take_outbox();
    let terminal = guard.is_terminal();
    drop(guard);

    for message in outbox {
      if self.inner.sender.send(message).await.is_err() {
        warn!("dispatcher_closed");
        break;
      }
    }
    if terminal {
      self.evict_overflow();
    }
  }

  /// Keep the cache within its bound by dropping finished runs.
  fn evict_overflow(&self) {
    let max = self.inner.config.max_cached_instances;
    let mut map = self.instances();
    if map.len() <= max {
      return;
    }
    let excess = map.len() - max;
    let finished: Vec<InstanceId> = map
      .iter()
      .filter(|(_, resident)| resident.is_terminal())
      .map(|(id, _)| id.clone())
      .take(excess)
      .collect();
    for id in finished {
      map.remove(&id);
      debug!(workflow_id = %id.workflow_id, run_id = %id.run_id, "instance_evicted");
    }
  }

  // ---------------------------------------------------------------------------
  // Event admission
  // ---------------------------------------------------------------------------

  /// Finish anything left over from an earlier, interrupted operation.
  /// Fails with [`EngineError::Terminal`] if that finishes the run.
  async fn settle(&self, inst: &mut Instance) -> Result<(), EngineError> {
    self.drain(inst).await?;
    let pending = inst.scheduler.pending_updates().to_vec();
    for (update_id, outcome) in pending {
      if inst.is_terminal() {
        break;
      }
      self.complete_update(inst, update_id, outcome).await?;
      self.drain(inst).await?;
    }
    inst.ensure_live()
  }

  async fn complete_update(
    &self,
    inst: &mut Instance,
    update_id: String,
    outcome: UpdateOutcome,
  ) -> Result<(), EngineError> {
    let succeeded = matches!(outcome, UpdateOutcome::Success(_));
    self
      .append(inst, EventKind::UpdateCompleted {
        update_id: update_id.clone(),
        outcome,
      })
      .await?;
    info!(update_id, succeeded, "update_completed");
    Ok(())
  }

  /// Append with retries on transient store failures.
  async fn append(&self, inst: &mut Instance, kind: EventKind) -> Result<Event, EngineError> {
    let retry = &self.inner.config.infra_retry;
    let mut attempt = 1;
    loop {
      match self.try_append(inst, kind.clone()).await {
        Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
          warn!(attempt, error = %e, "append_retrying");
          attempt += 1;
          tokio::time::sleep(retry.backoff()).await;
          // Catch-up may have ended the run or left commands behind.
          if !kind.is_terminal() {
            inst.ensure_live()?;
            self.drain(inst).await?;
          } else if inst.is_terminal() {
            return Err(EngineError::Terminal(inst.id().clone()));
          }
        }
        result => return result,
      }
    }
  }

  /// Acknowledge every command the scheduler has buffered.
  async fn drain(&self, inst: &mut Instance) -> Result<(), EngineError> {
    let retry = &self.inner.config.infra_retry;
    let mut failures = 0;
    while let Some(command) = inst.scheduler.next_command() {
      let kind = self.acknowledge(inst, command);
      match self.try_append(inst, kind).await {
        Ok(_) => failures = 0,
        Err(e) if e.is_retryable() && failures + 1 < retry.max_attempts => {
          failures += 1;
          warn!(attempt = failures, error = %e, "acknowledge_retrying");
          tokio::time::sleep(retry.backoff()).await;
        }
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  /// The event that records `command` as issued.
  fn acknowledge(&self, inst: &Instance, command: Command) -> EventKind {
    match command {
      Command::ScheduleActivity {
        seq,
        activity_type,
        input,
        options,
      } => EventKind::ActivityScheduled {
        seq,
        activity_type,
        input,
        options,
      },
      Command::StartTimer { seq, duration } => EventKind::TimerStarted {
        seq,
        fire_at: offset(Utc::now(), duration),
      },
      Command::StartChildWorkflow {
        seq,
        workflow_type,
        child,
        parent_close_policy,
        ..
      } => self.admit_child(inst, seq, workflow_type, child, parent_close_policy),
      Command::CancelChildWorkflow { child_seq, child } => EventKind::ChildCancelRequested {
        seq: child_seq,
        child,
      },
      Command::CompleteWorkflow { result } => EventKind::WorkflowCompleted { result },
      Command::FailWorkflow { message } => EventKind::WorkflowFailed {
        message,
        forced: false,
      },
      Command::CancelWorkflow => EventKind::WorkflowCancelled { forced: false },
    }
  }

  /// One append attempt: persist, apply, queue side effects.
  async fn try_append(&self, inst: &mut Instance, kind: EventKind) -> Result<Event, EngineError> {
    let id = inst.id().clone();
    let last = inst.scheduler.last_sequence();
    let limits = &self.inner.config.history;

    let kind = if last > 0 && last + 1 >= limits.max_events && !kind.is_terminal() {
      warn!(
        workflow_id = %id.workflow_id,
        run_id = %id.run_id,
        events = last + 1,
        "history_limit_exceeded"
      );
      EventKind::WorkflowFailed {
        message: HISTORY_LIMIT_MESSAGE.to_string(),
        forced: true,
      }
    } else {
      kind
    };
    if last + 1 > limits.warn_events && !inst.warned {
      inst.warned = true;
      warn!(
        workflow_id = %id.workflow_id,
        run_id = %id.run_id,
        events = last + 1,
        "history_size_warning"
      );
    }

    let event = Event::new(last + 1, Utc::now(), kind);
    if let Err(e) = self.inner.log.append(&id, last, &event).await {
      if matches!(e, weft_history::Error::Conflict { .. }) {
        warn!(workflow_id = %id.workflow_id, run_id = %id.run_id, error = %e, "append_conflict");
        self.catch_up(inst).await?;
      }
      return Err(e.into());
    }

    self.apply(inst, &event)?;
    self.after_append(inst, &event);
    Ok(event)
  }

  /// Apply events another writer appended since our last known sequence.
  async fn catch_up(&self, inst: &mut Instance) -> Result<(), EngineError> {
    let from = inst.scheduler.last_sequence() + 1;
    let events: Vec<Event> = self
      .inner
      .log
      .read_from(inst.id(), from)
      .try_collect()
      .await?;
    for event in &events {
      self.apply(inst, event)?;
    }
    if let Some(outcome) = inst.scheduler.outcome() {
      inst.outcome_tx.send_replace(Some(outcome.clone()));
    }
    Ok(())
  }

  fn apply(&self, inst: &mut Instance, event: &Event) -> Result<(), EngineError> {
    inst.scheduler.apply(event).map_err(|e| {
      let e = EngineError::from_scheduler(inst.id(), e);
      error!(
        workflow_id = %inst.id().workflow_id,
        run_id = %inst.id().run_id,
        sequence = event.sequence,
        error = %e,
        "non_determinism"
      );
      inst.broken = Some(e.to_string());
      e
    })
  }

  /// Queue the side effects of a freshly appended event.
  fn after_append(&self, inst: &mut Instance, event: &Event) {
    let id = inst.id().clone();
    match &event.kind {
      EventKind::ActivityScheduled {
        seq,
        activity_type,
        input,
        options,
      } => {
        debug!(seq, activity_type, "activity_scheduled");
        inst.outbox.push(Outbound::Activity {
          request: ActivityRequest {
            instance: id,
            seq: *seq,
            activity_type: activity_type.clone(),
            input: input.clone(),
            options: options
              .clone()
              .unwrap_or_else(|| self.inner.config.activity.clone()),
          },
          cancel: inst.cancel.clone(),
        });
      }
      EventKind::TimerStarted { seq, fire_at } => {
        inst.outbox.push(Outbound::Timer {
          instance: id,
          seq: *seq,
          fire_at: *fire_at,
        });
      }
      EventKind::ChildWorkflowStarted { seq, .. } => self.child_started(inst, *seq),
      EventKind::ChildCancelRequested { seq, child } => {
        if inst.scheduler.open_child(*seq).is_some() {
          inst.outbox.push(Outbound::CancelChild {
            child: child.clone(),
            reason: "cancelled by parent".to_string(),
          });
        }
      }
      kind if kind.is_terminal() => self.on_terminal(inst),
      _ => {}
    }
  }

  fn on_terminal(&self, inst: &mut Instance) {
    let Some(outcome) = inst.scheduler.outcome().cloned() else {
      return;
    };
    inst.cancel.cancel();
    inst.outcome_tx.send_replace(Some(outcome.clone()));

    let id = inst.id();
    match &outcome {
      WorkflowOutcome::Completed { .. } => {
        info!(workflow_id = %id.workflow_id, run_id = %id.run_id, "workflow_completed")
      }
      WorkflowOutcome::Failed { message } => {
        warn!(workflow_id = %id.workflow_id, run_id = %id.run_id, message, "workflow_failed")
      }
      WorkflowOutcome::Cancelled => {
        info!(workflow_id = %id.workflow_id, run_id = %id.run_id, "workflow_cancelled")
      }
      WorkflowOutcome::TimedOut => {
        warn!(workflow_id = %id.workflow_id, run_id = %id.run_id, "workflow_timed_out")
      }
    }

    self.close_out(inst);
  }
}

/// `at + duration`, saturating instead of overflowing.
pub(crate) fn offset(at: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(duration)
    .ok()
    .and_then(|d| at.checked_add_signed(d))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
