//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use weft_config::EngineConfig;
use weft_engine::{ActivityWorker, Engine};
use weft_history::{EventKind, EventLog, InstanceId};
use weft_workflow::{UpdateHandler, WorkflowContext, WorkflowError, WorkflowRegistry, workflow_fn};

/// An order that waits for approval, charges, then waits for shipping and
/// delivery. Address changes are rejected once shipped.
pub fn order_registry() -> WorkflowRegistry {
  let mut workflows = WorkflowRegistry::new();
  workflows.register(workflow_fn("order", order));
  workflows
}

async fn order(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
  ctx.update_state(|state| {
    state.set("status", "pending");
    state.set("address", input["address"].clone());
    state.set("changes", 0);
  });

  ctx.on_signal("approve", |state, _| {
    state.set("status", "approved");
    Ok(())
  })?;
  ctx.on_signal("ship", |state, _| {
    state.set("status", "shipped");
    Ok(())
  })?;
  ctx.on_signal("deliver", |state, _| {
    state.set("status", "delivered");
    Ok(())
  })?;

  ctx.on_update(
    "changeAddress",
    UpdateHandler::new(|state, address| {
      let changes = state.get::<u64>("changes").unwrap_or(0);
      state.set("changes", changes + 1);
      state.set("address", address.clone());
      Ok(address)
    })
    .validator(|state, address| {
      if state.get_str("status") == Some("shipped") {
        return Err("cannot change address after shipping".to_string());
      }
      if !address.is_string() {
        return Err("address must be a string".to_string());
      }
      Ok(())
    }),
  )?;

  ctx.on_query("status", |state, _| {
    Ok(state.get_value("status").cloned().unwrap_or(Value::Null))
  })?;
  ctx.on_query("address", |state, _| {
    Ok(state.get_value("address").cloned().unwrap_or(Value::Null))
  })?;

  ctx
    .wait_condition(|state| state.get_str("status") == Some("approved"))
    .await?;
  let receipt = ctx
    .activity("charge", json!({ "order_id": input["order_id"] }))
    .await?;
  ctx
    .wait_condition(|state| state.get_str("status") == Some("delivered"))
    .await?;

  let address = ctx.state(|state| state.get_value("address").cloned());
  Ok(json!({ "receipt": receipt, "address": address }))
}

/// Activities used by the order workflow. Counts `charge` invocations.
pub fn order_activities(charges: Arc<AtomicUsize>) -> ActivityWorker {
  let mut worker = ActivityWorker::new();
  worker.register("charge", move |input| {
    let charges = Arc::clone(&charges);
    async move {
      charges.fetch_add(1, Ordering::SeqCst);
      Ok(json!({ "receipt": format!("r-{}", input["order_id"]) }))
    }
  });
  worker
}

pub fn order_input() -> Value {
  json!({ "order_id": 7, "address": "1 Main St" })
}

/// A started engine over `log`.
pub fn engine_with(
  log: Arc<dyn EventLog>,
  workflows: WorkflowRegistry,
  activities: ActivityWorker,
  config: EngineConfig,
) -> (Engine, CancellationToken) {
  let engine = Engine::builder()
    .config(config)
    .event_log(log)
    .workflows(workflows)
    .activities(activities)
    .build();
  let cancel = CancellationToken::new();
  engine.start(cancel.clone()).unwrap();
  (engine, cancel)
}

/// Event type names of a run's history, in order.
pub async fn kinds(engine: &Engine, id: &InstanceId) -> Vec<&'static str> {
  engine
    .history(id)
    .await
    .unwrap()
    .iter()
    .map(|event| event.kind.name())
    .collect()
}

/// Poll until the run's history contains an event named `kind`.
pub async fn wait_for_event(engine: &Engine, id: &InstanceId, kind: &str) {
  for _ in 0..200 {
    if kinds(engine, id).await.contains(&kind) {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("no {kind} event recorded for {id}");
}

/// The child started by `parent`, once its start is recorded.
pub async fn child_of(engine: &Engine, parent: &InstanceId) -> InstanceId {
  wait_for_event(engine, parent, "child_workflow_started").await;
  engine
    .history(parent)
    .await
    .unwrap()
    .into_iter()
    .find_map(|event| match event.kind {
      EventKind::ChildWorkflowStarted { child, .. } => Some(child),
      _ => None,
    })
    .unwrap()
}

/// Wait for the run to finish, bounded so a hang fails the test.
pub async fn outcome(engine: &Engine, id: &InstanceId) -> weft_workflow::WorkflowOutcome {
  tokio::time::timeout(Duration::from_secs(5), engine.result(id))
    .await
    .expect("workflow did not finish in time")
    .unwrap()
}
