//! End-to-end tests for the engine's inbound surface.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use weft_config::{ActivityOptions, EngineConfig, HistoryLimits, MissedTriggerPolicy, RetryPolicy};
use weft_engine::{
  ActivityWorker, EngineError, HISTORY_LIMIT_MESSAGE, ScheduleTrigger, StartRequest,
};
use weft_history::{Error, Event, EventKind, EventLog, EventStream, InstanceId, MemoryEventLog};
use weft_workflow::{
  ChildOptions, WorkflowContext, WorkflowError, WorkflowOutcome, WorkflowRegistry, workflow_fn,
};

use common::*;

fn memory_log() -> Arc<dyn EventLog> {
  Arc::new(MemoryEventLog::new())
}

async fn start_order(engine: &weft_engine::Engine) -> InstanceId {
  engine
    .start_workflow(StartRequest::new("order-7", "order", order_input()))
    .await
    .unwrap()
}

#[tokio::test]
async fn test_signal_then_query_reports_approved() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = start_order(&engine).await;

  assert_eq!(engine.query(&id, "status", Value::Null).await.unwrap(), "pending");
  engine.signal(&id, "approve", Value::Null).await.unwrap();
  assert_eq!(engine.query(&id, "status", Value::Null).await.unwrap(), "approved");
}

#[tokio::test]
async fn test_order_runs_to_completion() {
  let charges = Arc::new(AtomicUsize::new(0));
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::clone(&charges)),
    EngineConfig::default(),
  );
  let id = start_order(&engine).await;

  engine.signal(&id, "approve", Value::Null).await.unwrap();
  wait_for_event(&engine, &id, "activity_completed").await;
  engine.signal(&id, "ship", Value::Null).await.unwrap();
  engine.signal(&id, "deliver", Value::Null).await.unwrap();

  assert_eq!(
    outcome(&engine, &id).await,
    WorkflowOutcome::Completed {
      result: json!({ "receipt": { "receipt": "r-7" }, "address": "1 Main St" })
    }
  );
  assert_eq!(charges.load(Ordering::SeqCst), 1);
  assert_eq!(
    kinds(&engine, &id).await,
    vec![
      "workflow_started",
      "signal_received",
      "activity_scheduled",
      "activity_completed",
      "signal_received",
      "signal_received",
      "workflow_completed",
    ]
  );
}

#[tokio::test]
async fn test_update_changes_address() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = start_order(&engine).await;

  let result = engine
    .update(&id, "changeAddress", json!("2 Side St"))
    .await
    .unwrap();
  assert_eq!(result, "2 Side St");
  assert_eq!(engine.query(&id, "address", Value::Null).await.unwrap(), "2 Side St");

  let history = kinds(&engine, &id).await;
  assert_eq!(&history[1..], &["update_accepted", "update_completed"]);
}

#[tokio::test]
async fn test_update_rejected_after_shipping() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = start_order(&engine).await;
  engine.signal(&id, "approve", Value::Null).await.unwrap();
  engine.signal(&id, "ship", Value::Null).await.unwrap();

  let err = engine
    .update(&id, "changeAddress", json!(""))
    .await
    .unwrap_err();
  match err {
    EngineError::Validation { reason } => assert!(reason.contains("cannot change address")),
    other => panic!("unexpected error: {other}"),
  }

  assert_eq!(engine.query(&id, "address", Value::Null).await.unwrap(), "1 Main St");
  let history = kinds(&engine, &id).await;
  assert!(history.contains(&"update_rejected"));
  assert!(!history.contains(&"update_accepted"));
}

#[tokio::test]
async fn test_unknown_update_is_rejected_and_recorded() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = start_order(&engine).await;

  let err = engine.update(&id, "cancelOrder", Value::Null).await.unwrap_err();
  assert!(matches!(err, EngineError::Validation { .. }));
  assert_eq!(kinds(&engine, &id).await.last(), Some(&"update_rejected"));
}

#[tokio::test]
async fn test_queries_append_nothing() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = start_order(&engine).await;
  let before = engine.history(&id).await.unwrap().len();

  for _ in 0..3 {
    engine.query(&id, "status", Value::Null).await.unwrap();
  }
  let err = engine.query(&id, "eta", Value::Null).await.unwrap_err();
  assert!(matches!(err, EngineError::UnknownHandler { ref name, .. } if name == "eta"));

  assert_eq!(engine.history(&id).await.unwrap().len(), before);
}

fn collector_registry() -> WorkflowRegistry {
  let mut workflows = WorkflowRegistry::new();
  workflows.register(workflow_fn("collector", |ctx: WorkflowContext, _| async move {
    ctx.on_signal("item", |state, payload| {
      let mut items = state.get::<Vec<Value>>("items").unwrap_or_default();
      items.push(payload);
      state.set("items", items);
      Ok(())
    })?;
    ctx.on_query("items", |state, _| {
      Ok(state.get_value("items").cloned().unwrap_or(json!([])))
    })?;
    ctx.wait_condition(|_| false).await?;
    Ok(Value::Null)
  }));
  workflows
}

#[tokio::test]
async fn test_signals_are_applied_in_arrival_order() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    collector_registry(),
    ActivityWorker::new(),
    EngineConfig::default(),
  );
  let id = engine
    .start_workflow(StartRequest::new("collect-1", "collector", Value::Null))
    .await
    .unwrap();

  for i in 1..=5 {
    engine.signal(&id, "item", json!(i)).await.unwrap();
  }
  assert_eq!(
    engine.query(&id, "items", Value::Null).await.unwrap(),
    json!([1, 2, 3, 4, 5])
  );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_signals_follow_log_order() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    collector_registry(),
    ActivityWorker::new(),
    EngineConfig::default(),
  );
  let id = engine
    .start_workflow(StartRequest::new("collect-2", "collector", Value::Null))
    .await
    .unwrap();

  let senders: Vec<_> = (1..=16)
    .map(|i| {
      let engine = engine.clone();
      let id = id.clone();
      tokio::spawn(async move { engine.signal(&id, "item", json!(i)).await })
    })
    .collect();
  for sender in senders {
    sender.await.unwrap().unwrap();
  }

  let logged: Vec<Value> = engine
    .history(&id)
    .await
    .unwrap()
    .into_iter()
    .filter_map(|event| match event.kind {
      EventKind::SignalReceived { payload, .. } => Some(payload),
      _ => None,
    })
    .collect();
  assert_eq!(logged.len(), 16);
  assert_eq!(
    engine.query(&id, "items", Value::Null).await.unwrap(),
    Value::Array(logged)
  );
}

#[tokio::test]
async fn test_duplicate_start_is_rejected_while_running() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  start_order(&engine).await;

  let err = engine
    .start_workflow(StartRequest::new("order-7", "order", order_input()))
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::AlreadyStarted { .. }));

  let err = engine
    .start_workflow(StartRequest::new("x", "refund", Value::Null))
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::UnknownWorkflowType(t) if t == "refund"));
}

// -----------------------------------------------------------------------------
// Children and start authorization
// -----------------------------------------------------------------------------

fn checkout_registry() -> WorkflowRegistry {
  let mut workflows = WorkflowRegistry::new();

  workflows.register(workflow_fn("checkout", |ctx: WorkflowContext, input: Value| async move {
    let receipt = ctx.child("payment", input).await?;
    Ok(json!({ "paid": receipt }))
  }));

  workflows.register(workflow_fn("rogue", |ctx: WorkflowContext, input: Value| async move {
    match ctx.child("payment", input).await {
      Err(WorkflowError::ChildStartRejected { reason }) => Ok(json!({ "rejected": reason })),
      other => other,
    }
  }));

  workflows.register(workflow_fn("supervisor", |ctx: WorkflowContext, _| async move {
    let options = ChildOptions {
      workflow_id: Some("payment-held".to_string()),
      ..ChildOptions::default()
    };
    let _child = ctx.child_with("payment", json!({ "hold": true }), options);
    ctx.on_signal("abort", |state, _| {
      state.set("aborted", true);
      Ok(())
    })?;
    ctx.wait_condition(|state| state.get_bool("aborted")).await?;
    Err(WorkflowError::failed("aborted"))
  }));

  workflows.register_private(
    workflow_fn("payment", |ctx: WorkflowContext, input: Value| async move {
      if input["hold"] == json!(true) {
        ctx.wait_condition(|_| false).await?;
      }
      ctx.activity("charge", json!({ "order_id": 9 })).await
    }),
    ["checkout", "supervisor"],
  );

  workflows
}

#[tokio::test]
async fn test_private_workflow_cannot_start_top_level() {
  let log = memory_log();
  let (engine, _cancel) = engine_with(
    Arc::clone(&log),
    checkout_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );

  let err = engine
    .start_workflow(StartRequest::new("pay-1", "payment", json!({})))
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::UnauthorizedStart { .. }));
  assert!(log.instances().await.unwrap().is_empty());
  assert_eq!(engine.resident_count(), 0);
}

#[tokio::test]
async fn test_child_result_reaches_parent() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    checkout_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = engine
    .start_workflow(StartRequest::new("checkout-1", "checkout", json!({})))
    .await
    .unwrap();

  assert_eq!(
    outcome(&engine, &id).await,
    WorkflowOutcome::Completed {
      result: json!({ "paid": { "receipt": "r-9" } })
    }
  );

  let child = child_of(&engine, &id).await;
  assert_eq!(child.workflow_id, "checkout-1/child-1");
  let history = engine.history(&child).await.unwrap();
  match &history[0].kind {
    weft_history::EventKind::WorkflowStarted { parent, .. } => {
      assert_eq!(parent.as_ref().map(|p| &p.instance), Some(&id));
    }
    other => panic!("unexpected first event: {other:?}"),
  }
}

#[tokio::test]
async fn test_child_start_denied_for_unlisted_parent() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    checkout_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = engine
    .start_workflow(StartRequest::new("rogue-1", "rogue", json!({})))
    .await
    .unwrap();

  match outcome(&engine, &id).await {
    WorkflowOutcome::Completed { result } => {
      let reason = result["rejected"].as_str().unwrap();
      assert!(reason.contains("payment"));
    }
    other => panic!("unexpected outcome: {other:?}"),
  }
  assert!(kinds(&engine, &id).await.contains(&"child_workflow_start_failed"));
  assert_eq!(engine.event_log().instances().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_terminate_policy_cancels_open_child() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    checkout_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = engine
    .start_workflow(StartRequest::new("super-1", "supervisor", Value::Null))
    .await
    .unwrap();
  let child = child_of(&engine, &id).await;
  assert_eq!(child.workflow_id, "payment-held");

  // The child exists once its own history has a start event.
  wait_for_event(&engine, &child, "workflow_started").await;
  engine.signal(&id, "abort", Value::Null).await.unwrap();

  assert_eq!(
    outcome(&engine, &id).await,
    WorkflowOutcome::Failed {
      message: "aborted".to_string()
    }
  );
  assert_eq!(outcome(&engine, &child).await, WorkflowOutcome::Cancelled);
}

// -----------------------------------------------------------------------------
// Cancellation and timeouts
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_request_runs_compensation() {
  let released = Arc::new(AtomicUsize::new(0));
  let mut workflows = WorkflowRegistry::new();
  workflows.register(workflow_fn("booking", |ctx: WorkflowContext, _| async move {
    ctx.activity("reserve", Value::Null).await?;
    ctx.cancelled().await;
    ctx.activity("release", Value::Null).await?;
    Err(WorkflowError::Cancelled)
  }));

  let mut worker = ActivityWorker::new();
  worker.register("reserve", |_| async { Ok(json!("seat-1")) });
  let counter = Arc::clone(&released);
  worker.register("release", move |_| {
    let counter = Arc::clone(&counter);
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(Value::Null)
    }
  });

  let (engine, _cancel) = engine_with(memory_log(), workflows, worker, EngineConfig::default());
  let id = engine
    .start_workflow(StartRequest::new("booking-1", "booking", Value::Null))
    .await
    .unwrap();
  wait_for_event(&engine, &id, "activity_completed").await;

  engine.request_cancel(&id, "customer changed plans").await.unwrap();
  // A second request is a no-op.
  engine.request_cancel(&id, "again").await.unwrap();

  assert_eq!(outcome(&engine, &id).await, WorkflowOutcome::Cancelled);
  assert_eq!(released.load(Ordering::SeqCst), 1);
  let history = kinds(&engine, &id).await;
  assert_eq!(history.iter().filter(|k| **k == "cancel_requested").count(), 1);
  assert_eq!(history.last(), Some(&"workflow_cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_ignored_cancel_is_forced_after_grace_period() {
  let mut workflows = WorkflowRegistry::new();
  workflows.register(workflow_fn("stubborn", |ctx: WorkflowContext, _| async move {
    let _ = ctx.wait_condition(|_| false).await;
    // Created after the cancel request, so it is not interrupted by it.
    ctx.wait_condition(|_| false).await?;
    Ok(Value::Null)
  }));
  let config = EngineConfig {
    cancellation_grace_period_ms: 2_000,
    ..EngineConfig::default()
  };
  let (engine, _cancel) = engine_with(memory_log(), workflows, ActivityWorker::new(), config);
  let id = engine
    .start_workflow(StartRequest::new("stubborn-1", "stubborn", Value::Null))
    .await
    .unwrap();

  engine.request_cancel(&id, "shutdown").await.unwrap();
  assert_eq!(outcome(&engine, &id).await, WorkflowOutcome::Cancelled);
  let history = engine.history(&id).await.unwrap();
  assert_eq!(
    history.last().map(|e| &e.kind),
    Some(&EventKind::WorkflowCancelled { forced: true })
  );
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = engine
    .start_workflow(
      StartRequest::new("order-slow", "order", order_input())
        .execution_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap();

  assert_eq!(outcome(&engine, &id).await, WorkflowOutcome::TimedOut);
  let err = engine.signal(&id, "approve", Value::Null).await.unwrap_err();
  assert!(matches!(err, EngineError::Terminal(_)));
}

#[tokio::test]
async fn test_terminate_forces_cancellation() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = start_order(&engine).await;

  engine.terminate(&id).await.unwrap();
  engine.terminate(&id).await.unwrap();

  assert_eq!(outcome(&engine, &id).await, WorkflowOutcome::Cancelled);
  let history = engine.history(&id).await.unwrap();
  assert_eq!(
    history.last().map(|e| &e.kind),
    Some(&EventKind::WorkflowCancelled { forced: true })
  );
}

// -----------------------------------------------------------------------------
// Limits, retries, infrastructure failures
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_history_limit_fails_workflow() {
  let config = EngineConfig {
    history: HistoryLimits {
      max_events: 6,
      warn_events: 3,
    },
    ..EngineConfig::default()
  };
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    config,
  );
  let id = start_order(&engine).await;

  let mut refused = 0;
  for _ in 0..8 {
    if engine.signal(&id, "noop", Value::Null).await.is_err() {
      refused += 1;
    }
  }

  assert_eq!(
    outcome(&engine, &id).await,
    WorkflowOutcome::Failed {
      message: HISTORY_LIMIT_MESSAGE.to_string()
    }
  );
  assert_eq!(engine.history(&id).await.unwrap().len(), 6);
  assert_eq!(refused, 4);
}

#[tokio::test]
async fn test_activity_retries_are_not_recorded_per_attempt() {
  let attempts = Arc::new(AtomicUsize::new(0));
  let mut worker = ActivityWorker::new();
  let counter = Arc::clone(&attempts);
  worker.register("flaky", move |_| {
    let counter = Arc::clone(&counter);
    async move {
      if counter.fetch_add(1, Ordering::SeqCst) < 2 {
        Err("transient".to_string())
      } else {
        Ok(json!("done"))
      }
    }
  });

  let mut workflows = WorkflowRegistry::new();
  workflows.register(workflow_fn("retrying", |ctx: WorkflowContext, _| async move {
    let options = ActivityOptions {
      start_to_close_timeout_ms: 1_000,
      retry: RetryPolicy {
        max_attempts: 3,
        initial_interval_ms: 1,
        ..RetryPolicy::default()
      },
    };
    ctx.activity_with("flaky", Value::Null, options).await
  }));

  let (engine, _cancel) = engine_with(memory_log(), workflows, worker, EngineConfig::default());
  let id = engine
    .start_workflow(StartRequest::new("retry-1", "retrying", Value::Null))
    .await
    .unwrap();

  assert_eq!(
    outcome(&engine, &id).await,
    WorkflowOutcome::Completed { result: json!("done") }
  );
  assert_eq!(attempts.load(Ordering::SeqCst), 3);
  assert_eq!(
    kinds(&engine, &id).await,
    vec![
      "workflow_started",
      "activity_scheduled",
      "activity_completed",
      "workflow_completed"
    ]
  );
}

/// Event log that reports a conflict on its first append.
struct ConflictOnce {
  inner: MemoryEventLog,
  appends: AtomicUsize,
}

#[async_trait]
impl EventLog for ConflictOnce {
  async fn append(&self, instance: &InstanceId, expected_last: u64, event: &Event) -> Result<u64, Error> {
    if self.appends.fetch_add(1, Ordering::SeqCst) == 0 {
      return Err(Error::Conflict {
        instance: instance.clone(),
        expected: expected_last,
        actual: expected_last,
      });
    }
    self.inner.append(instance, expected_last, event).await
  }

  fn read_from<'a>(&'a self, instance: &InstanceId, from: u64) -> EventStream<'a> {
    self.inner.read_from(instance, from)
  }

  async fn last_sequence(&self, instance: &InstanceId) -> Result<u64, Error> {
    self.inner.last_sequence(instance).await
  }

  async fn instances(&self) -> Result<Vec<InstanceId>, Error> {
    self.inner.instances().await
  }
}

#[tokio::test]
async fn test_append_conflict_is_retried() {
  let log = Arc::new(ConflictOnce {
    inner: MemoryEventLog::new(),
    appends: AtomicUsize::new(0),
  });
  let (engine, _cancel) = engine_with(
    Arc::clone(&log) as Arc<dyn EventLog>,
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );

  let id = start_order(&engine).await;
  assert_eq!(kinds(&engine, &id).await, vec!["workflow_started"]);
  assert_eq!(log.appends.load(Ordering::SeqCst), 2);
}

// -----------------------------------------------------------------------------
// Schedules and residency
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_schedule_trigger_starts_runs() {
  let mut workflows = WorkflowRegistry::new();
  workflows.register(workflow_fn("report", |_ctx: WorkflowContext, input: Value| async move {
    Ok(input)
  }));
  let (engine, _cancel) = engine_with(
    memory_log(),
    workflows,
    ActivityWorker::new(),
    EngineConfig::default(),
  );

  let trigger = ScheduleTrigger::new("nightly", "report", Duration::from_millis(20))
    .input(json!({ "kind": "sales" }))
    .missed(MissedTriggerPolicy::Skip);
  let stop = tokio_util::sync::CancellationToken::new();
  let task = tokio::spawn(trigger.run(engine.clone(), stop.clone()));
  tokio::time::sleep(Duration::from_millis(90)).await;
  stop.cancel();
  task.await.unwrap();

  let runs = engine.event_log().instances().await.unwrap();
  assert!(runs.len() >= 2, "expected at least two runs, got {}", runs.len());
  assert!(runs.iter().all(|id| id.workflow_id.starts_with("nightly-")));
}

#[tokio::test]
async fn test_schedule_trigger_with_zero_interval_starts_nothing() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );

  let trigger = ScheduleTrigger::new("never", "order", Duration::ZERO).input(order_input());
  let stop = tokio_util::sync::CancellationToken::new();
  let task = tokio::spawn(trigger.run(engine.clone(), stop));
  tokio::time::timeout(Duration::from_secs(1), task)
    .await
    .expect("trigger did not return")
    .unwrap();

  assert!(engine.event_log().instances().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_finished_runs_are_evicted_and_replayed_on_demand() {
  let (engine, _cancel) = engine_with(
    memory_log(),
    order_registry(),
    order_activities(Arc::default()),
    EngineConfig::default(),
  );
  let id = start_order(&engine).await;
  engine.terminate(&id).await.unwrap();
  outcome(&engine, &id).await;

  assert_eq!(engine.evict_terminal(), 1);
  assert_eq!(engine.resident_count(), 0);

  assert_eq!(engine.query(&id, "status", Value::Null).await.unwrap(), "pending");
  assert_eq!(outcome(&engine, &id).await, WorkflowOutcome::Cancelled);
}
