//! The workflow-facing API and the durable futures it hands out.
//!
//! Every future here is resolved purely from applied history events. None of
//! them registers a waker: the scheduler polls the workflow after each event,
//! which is what drives them forward.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;
use weft_config::ActivityOptions;
use weft_history::{InstanceId, ParentClosePolicy, ParentRef, UpdateOutcome};

use crate::command::Command;
use crate::error::{HandlerError, WorkflowError};
use crate::handler::{HandlerKind, HandlerRegistry, SignalFn, UpdateHandler};
use crate::state::WorkflowState;

/// Options for starting a child workflow.
#[derive(Debug, Clone, Default)]
pub struct ChildOptions {
  /// Explicit workflow id. Defaults to `"{parent_workflow_id}/child-{seq}"`.
  pub workflow_id: Option<String>,
  pub parent_close_policy: ParentClosePolicy,
  pub execution_timeout: Option<Duration>,
}

/// How [`join_children`] aggregates completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
  /// Resolve with the first failure as soon as it is observed.
  #[default]
  FailFast,
  /// Wait for every child, then report the first failure in input order.
  AllSettled,
}

struct CtxInner {
  instance: InstanceId,
  workflow_type: String,
  namespace: String,
  parent: Option<ParentRef>,
  now: DateTime<Utc>,
  next_seq: u64,
  uuid_counter: u64,
  commands: VecDeque<Command>,
  resolutions: HashMap<u64, Result<Value, WorkflowError>>,
  child_cancels: HashSet<u64>,
  state: WorkflowState,
  handlers: HandlerRegistry,
  buffered_signals: Vec<(String, Value)>,
  cancel_requested: bool,
  fatal: Option<String>,
  replaying: bool,
}

impl CtxInner {
  fn allocate_seq(&mut self) -> u64 {
    self.next_seq += 1;
    self.next_seq
  }
}

/// Handle through which workflow logic talks to its instance.
///
/// Cheap to clone. All reads of time, randomness and external results go
/// through here so that replay observes exactly what the live run observed.
///
/// Handler callbacks receive the instance state as an argument and must not
/// call back into the context.
#[derive(Clone)]
pub struct WorkflowContext {
  inner: Arc<Mutex<CtxInner>>,
}

impl WorkflowContext {
  pub(crate) fn new(instance: InstanceId) -> Self {
    Self {
      inner: Arc::new(Mutex::new(CtxInner {
        instance,
        workflow_type: String::new(),
        namespace: String::new(),
        parent: None,
        now: DateTime::<Utc>::default(),
        next_seq: 0,
        uuid_counter: 0,
        commands: VecDeque::new(),
        resolutions: HashMap::new(),
        child_cancels: HashSet::new(),
        state: WorkflowState::new(),
        handlers: HandlerRegistry::new(),
        buffered_signals: Vec::new(),
        cancel_requested: false,
        fatal: None,
        replaying: false,
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, CtxInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn instance(&self) -> InstanceId {
    self.lock().instance.clone()
  }

  pub fn workflow_type(&self) -> String {
    self.lock().workflow_type.clone()
  }

  pub fn namespace(&self) -> String {
    self.lock().namespace.clone()
  }

  /// The parent that started this run, if it is a child.
  pub fn parent(&self) -> Option<ParentRef> {
    self.lock().parent.clone()
  }

  /// Deterministic time: the timestamp of the last applied event.
  pub fn now(&self) -> DateTime<Utc> {
    self.lock().now
  }

  /// Deterministic UUID derived from the run id and a per-run counter.
  pub fn new_uuid(&self) -> Uuid {
    let mut inner = self.lock();
    inner.uuid_counter += 1;
    let name = format!("{}:{}", inner.instance.run_id, inner.uuid_counter);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
  }

  /// Whether the scheduler is re-executing recorded history.
  pub fn is_replaying(&self) -> bool {
    self.lock().replaying
  }

  pub fn is_cancel_requested(&self) -> bool {
    self.lock().cancel_requested
  }

  /// Read the instance state.
  pub fn state<R>(&self, f: impl FnOnce(&WorkflowState) -> R) -> R {
    self.detached_state(|state| f(state))
  }

  /// Mutate the instance state.
  pub fn update_state<R>(&self, f: impl FnOnce(&mut WorkflowState) -> R) -> R {
    self.detached_state(f)
  }

  /// Run `f` on the state without holding the context lock.
  fn detached_state<R>(&self, f: impl FnOnce(&mut WorkflowState) -> R) -> R {
    let mut state = std::mem::take(&mut self.lock().state);
    let out = f(&mut state);
    self.lock().state = state;
    out
  }

  /// Schedule an activity with the engine's default options.
  pub fn activity(&self, activity_type: impl Into<String>, input: Value) -> ActivityFuture {
    self.schedule_activity(activity_type.into(), input, None)
  }

  /// Schedule an activity with explicit timeout and retry options.
  pub fn activity_with(
    &self,
    activity_type: impl Into<String>,
    input: Value,
    options: ActivityOptions,
  ) -> ActivityFuture {
    self.schedule_activity(activity_type.into(), input, Some(options))
  }

  fn schedule_activity(
    &self,
    activity_type: String,
    input: Value,
    options: Option<ActivityOptions>,
  ) -> ActivityFuture {
    let mut inner = self.lock();
    let seq = inner.allocate_seq();
    inner.commands.push_back(Command::ScheduleActivity {
      seq,
      activity_type,
      input,
      options,
    });
    ActivityFuture {
      pending: Pending::new(self.clone(), seq, !inner.cancel_requested),
    }
  }

  /// Durable timer.
  pub fn sleep(&self, duration: Duration) -> TimerFuture {
    let mut inner = self.lock();
    let seq = inner.allocate_seq();
    inner.commands.push_back(Command::StartTimer { seq, duration });
    TimerFuture {
      pending: Pending::new(self.clone(), seq, !inner.cancel_requested),
    }
  }

  /// Start a child workflow with default options.
  pub fn child(&self, workflow_type: impl Into<String>, input: Value) -> ChildFuture {
    self.child_with(workflow_type, input, ChildOptions::default())
  }

  pub fn child_with(
    &self,
    workflow_type: impl Into<String>,
    input: Value,
    options: ChildOptions,
  ) -> ChildFuture {
    let mut inner = self.lock();
    let seq = inner.allocate_seq();
    let workflow_id = options
      .workflow_id
      .unwrap_or_else(|| format!("{}/child-{seq}", inner.instance.workflow_id));
    let run_name = format!("{}:child:{seq}", inner.instance.run_id);
    let child = InstanceId::new(
      workflow_id,
      Uuid::new_v5(&Uuid::NAMESPACE_OID, run_name.as_bytes()).to_string(),
    );

    inner.commands.push_back(Command::StartChildWorkflow {
      seq,
      workflow_type: workflow_type.into(),
      child: child.clone(),
      input,
      parent_close_policy: options.parent_close_policy,
      execution_timeout: options.execution_timeout,
    });
    ChildFuture {
      pending: Pending::new(self.clone(), seq, !inner.cancel_requested),
      child,
    }
  }

  /// Ask a running child to cancel. No-op once the child has reported back
  /// or a cancel was already issued.
  pub fn cancel_child(&self, child: &ChildFuture) {
    let seq = child.seq();
    let mut inner = self.lock();
    if inner.resolutions.contains_key(&seq) || !inner.child_cancels.insert(seq) {
      return;
    }
    inner.commands.push_back(Command::CancelChildWorkflow {
      child_seq: seq,
      child: child.instance().clone(),
    });
  }

  /// Suspend until `predicate` holds over the instance state.
  ///
  /// The predicate is re-evaluated on every scheduler pass and must not call
  /// back into the context.
  pub fn wait_condition<P>(&self, predicate: P) -> ConditionFuture
  where
    P: Fn(&WorkflowState) -> bool + Send + 'static,
  {
    ConditionFuture {
      ctx: self.clone(),
      predicate: Box::new(predicate),
      cancellable: !self.lock().cancel_requested,
    }
  }

  /// Resolves once a cancel request has been delivered to this run.
  pub fn cancelled(&self) -> CancelledFuture {
    CancelledFuture { ctx: self.clone() }
  }

  /// Wait for several children (or any durable futures) together.
  pub fn join_children<F>(&self, futures: Vec<F>, policy: WaitPolicy) -> JoinChildren<F>
  where
    F: Future<Output = Result<Value, WorkflowError>> + Unpin,
  {
    join_children(futures, policy)
  }

  /// Register a signal handler. Signals that arrived before registration
  /// are delivered now, in arrival order.
  pub fn on_signal<F>(&self, name: &str, handler: F) -> Result<(), HandlerError>
  where
    F: Fn(&mut WorkflowState, Value) -> Result<(), String> + Send + Sync + 'static,
  {
    let handler: SignalFn = Arc::new(handler);
    let buffered = {
      let mut inner = self.lock();
      inner.handlers.register_signal(name, Arc::clone(&handler))?;
      let mut buffered = Vec::new();
      inner.buffered_signals.retain(|(signal, payload)| {
        if signal == name {
          buffered.push(payload.clone());
          false
        } else {
          true
        }
      });
      buffered
    };

    for payload in buffered {
      self.run_signal(name, &handler, payload);
    }
    Ok(())
  }

  pub fn on_update(&self, name: &str, handler: UpdateHandler) -> Result<(), HandlerError> {
    self.lock().handlers.register_update(name, handler)
  }

  pub fn on_query<F>(&self, name: &str, handler: F) -> Result<(), HandlerError>
  where
    F: Fn(&WorkflowState, &Value) -> Result<Value, String> + Send + Sync + 'static,
  {
    self.lock().handlers.register_query(name, Arc::new(handler))
  }

  // Scheduler-side operations.

  pub(crate) fn init(
    &self,
    workflow_type: &str,
    namespace: &str,
    parent: Option<ParentRef>,
  ) {
    let mut inner = self.lock();
    inner.workflow_type = workflow_type.to_string();
    inner.namespace = namespace.to_string();
    inner.parent = parent;
  }

  pub(crate) fn set_now(&self, now: DateTime<Utc>) {
    self.lock().now = now;
  }

  pub(crate) fn set_replaying(&self, replaying: bool) {
    self.lock().replaying = replaying;
  }

  pub(crate) fn front_command(&self) -> Option<Command> {
    self.lock().commands.front().cloned()
  }

  pub(crate) fn pop_command(&self) -> Option<Command> {
    self.lock().commands.pop_front()
  }

  pub(crate) fn push_command(&self, command: Command) {
    self.lock().commands.push_back(command);
  }

  pub(crate) fn has_commands(&self) -> bool {
    !self.lock().commands.is_empty()
  }

  pub(crate) fn clear_commands(&self) {
    self.lock().commands.clear();
  }

  pub(crate) fn resolve(&self, seq: u64, result: Result<Value, WorkflowError>) {
    self.lock().resolutions.insert(seq, result);
  }

  pub(crate) fn request_cancel(&self) {
    self.lock().cancel_requested = true;
  }

  pub(crate) fn take_fatal(&self) -> Option<String> {
    self.lock().fatal.take()
  }

  pub(crate) fn deliver_signal(&self, name: &str, payload: Value) {
    let handler = {
      let mut inner = self.lock();
      match inner.handlers.signal(name) {
        Some(handler) => handler,
        None => {
          inner.buffered_signals.push((name.to_string(), payload));
          return;
        }
      }
    };
    self.run_signal(name, &handler, payload);
  }

  fn run_signal(&self, name: &str, handler: &SignalFn, payload: Value) {
    if let Err(e) = self.detached_state(|state| handler(state, payload)) {
      let mut inner = self.lock();
      if inner.fatal.is_none() {
        inner.fatal = Some(format!("signal handler '{name}' failed: {e}"));
      }
    }
  }

  pub(crate) fn validate_update(&self, name: &str, payload: &Value) -> Result<(), String> {
    let handler = self
      .lock()
      .handlers
      .update(name)
      .ok_or_else(|| format!("unknown update '{name}'"))?;
    self.detached_state(|state| handler.validate(state, payload))
  }

  /// Run an accepted update's mutator. `None` if no such handler exists.
  pub(crate) fn apply_update(&self, name: &str, payload: Value) -> Option<UpdateOutcome> {
    let handler = self.lock().handlers.update(name)?;
    let outcome = match self.detached_state(|state| (handler.mutator)(state, payload)) {
      Ok(value) => UpdateOutcome::Success(value),
      Err(message) => UpdateOutcome::Failure(message),
    };
    Some(outcome)
  }

  pub(crate) fn query(&self, name: &str, args: &Value) -> Result<Value, HandlerError> {
    let (handler, state) = {
      let inner = self.lock();
      let handler = inner
        .handlers
        .query(name)
        .ok_or_else(|| HandlerError::Unknown {
          name: name.to_string(),
          kind: HandlerKind::Query,
        })?;
      (handler, inner.state.clone())
    };
    handler(&state, args).map_err(HandlerError::Failed)
  }

  pub(crate) fn snapshot(&self) -> Value {
    self.lock().state.snapshot()
  }
}

/// Shared resolution logic for the seq-keyed futures.
struct Pending {
  ctx: WorkflowContext,
  seq: u64,
  /// Created before any cancel request, so a later request interrupts it.
  cancellable: bool,
}

impl Pending {
  fn new(ctx: WorkflowContext, seq: u64, cancellable: bool) -> Self {
    Self {
      ctx,
      seq,
      cancellable,
    }
  }

  fn poll_result(&self) -> Poll<Result<Value, WorkflowError>> {
    let inner = self.ctx.lock();
    if let Some(result) = inner.resolutions.get(&self.seq) {
      return Poll::Ready(result.clone());
    }
    if self.cancellable && inner.cancel_requested {
      return Poll::Ready(Err(WorkflowError::Cancelled));
    }
    Poll::Pending
  }
}

/// Result of a scheduled activity.
pub struct ActivityFuture {
  pending: Pending,
}

impl ActivityFuture {
  pub fn seq(&self) -> u64 {
    self.pending.seq
  }
}

impl Future for ActivityFuture {
  type Output = Result<Value, WorkflowError>;

  fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.pending.poll_result()
  }
}

/// Fires when the durable timer does.
pub struct TimerFuture {
  pending: Pending,
}

impl Future for TimerFuture {
  type Output = Result<(), WorkflowError>;

  fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.pending.poll_result().map(|r| r.map(|_| ()))
  }
}

/// Result of a child workflow run.
pub struct ChildFuture {
  pending: Pending,
  child: InstanceId,
}

impl ChildFuture {
  pub fn seq(&self) -> u64 {
    self.pending.seq
  }

  /// Identity the child runs under.
  pub fn instance(&self) -> &InstanceId {
    &self.child
  }
}

impl Future for ChildFuture {
  type Output = Result<Value, WorkflowError>;

  fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.pending.poll_result()
  }
}

pub struct ConditionFuture {
  ctx: WorkflowContext,
  predicate: Box<dyn Fn(&WorkflowState) -> bool + Send>,
  cancellable: bool,
}

impl Future for ConditionFuture {
  type Output = Result<(), WorkflowError>;

  fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
    let inner = self.ctx.lock();
    if (self.predicate)(&inner.state) {
      return Poll::Ready(Ok(()));
    }
    if self.cancellable && inner.cancel_requested {
      return Poll::Ready(Err(WorkflowError::Cancelled));
    }
    Poll::Pending
  }
}

pub struct CancelledFuture {
  ctx: WorkflowContext,
}

impl Future for CancelledFuture {
  type Output = ();

  fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
    if self.ctx.lock().cancel_requested {
      Poll::Ready(())
    } else {
      Poll::Pending
    }
  }
}

enum Slot<F> {
  Waiting(F),
  Done(Result<Value, WorkflowError>),
}

/// Fan-in over durable futures. See [`join_children`].
pub struct JoinChildren<F> {
  slots: Vec<Slot<F>>,
  policy: WaitPolicy,
}

/// Aggregate many child (or activity) results.
///
/// Every unresolved future is re-polled on each pass in input order, so the
/// outcome depends only on history. Resolves to all values in input order,
/// or to the first failure according to `policy`.
pub fn join_children<F>(futures: Vec<F>, policy: WaitPolicy) -> JoinChildren<F>
where
  F: Future<Output = Result<Value, WorkflowError>> + Unpin,
{
  JoinChildren {
    slots: futures.into_iter().map(Slot::Waiting).collect(),
    policy,
  }
}

impl<F> Future for JoinChildren<F>
where
  F: Future<Output = Result<Value, WorkflowError>> + Unpin,
{
  type Output = Result<Vec<Value>, WorkflowError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    let mut waiting = false;

    for slot in this.slots.iter_mut() {
      if let Slot::Waiting(future) = slot {
        let polled = Pin::new(future).poll(cx);
        match polled {
          Poll::Ready(Err(e)) if this.policy == WaitPolicy::FailFast => {
            return Poll::Ready(Err(e));
          }
          Poll::Ready(result) => *slot = Slot::Done(result),
          Poll::Pending => waiting = true,
        }
      }
    }

    if waiting {
      return Poll::Pending;
    }

    let results = std::mem::take(&mut this.slots)
      .into_iter()
      .filter_map(|slot| match slot {
        Slot::Done(result) => Some(result),
        Slot::Waiting(_) => None,
      });
    Poll::Ready(results.collect())
  }
}
