//! Built-in order workflow, driven end to end against a real history.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use weft_config::EngineConfig;
use weft_engine::{ActivityWorker, Engine, EngineError, StartRequest};
use weft_history::{Event, EventLog};
use weft_workflow::{UpdateHandler, WorkflowContext, WorkflowError, WorkflowRegistry, workflow_fn};

async fn order(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
  ctx.update_state(|state| {
    state.set("status", "pending");
    state.set("address", input["address"].clone());
  });

  for (signal, status) in [("approve", "approved"), ("ship", "shipped"), ("deliver", "delivered")] {
    ctx.on_signal(signal, move |state, _| {
      state.set("status", status);
      Ok(())
    })?;
  }

  ctx.on_update(
    "changeAddress",
    UpdateHandler::new(|state, address| {
      state.set("address", address.clone());
      Ok(address)
    })
    .validator(|state, _| match state.get_str("status") {
      Some("shipped") | Some("delivered") => {
        Err("cannot change address after shipping".to_string())
      }
      _ => Ok(()),
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

fn registry() -> WorkflowRegistry {
  let mut workflows = WorkflowRegistry::new();
  workflows.register(workflow_fn("order", order));
  workflows
}

fn activities() -> ActivityWorker {
  let mut worker = ActivityWorker::new();
  worker.register("charge", |input| async move {
    Ok(json!({ "receipt": format!("r-{}", input["order_id"]) }))
  });
  worker
}

/// Run one order through approval, an address change, shipping and
/// delivery. Returns the recorded history.
pub async fn run(log: Arc<dyn EventLog>, config: EngineConfig) -> Result<Vec<Event>> {
  let engine = Engine::builder()
    .config(config)
    .event_log(log)
    .workflows(registry())
    .activities(activities())
    .build();
  let cancel = CancellationToken::new();
  let dispatcher = engine.start(cancel.clone())?;

  let resumed = engine.recover().await?;
  if !resumed.is_empty() {
    info!(runs = resumed.len(), "resumed_unfinished_runs");
  }

  let request = StartRequest::new(
    format!("order-{}", std::process::id()),
    "order",
    json!({ "order_id": 7, "address": "1 Main St" }),
  );
  let id = engine
    .start_workflow(request)
    .await
    .context("failed to start order workflow")?;
  eprintln!("Started {id}");

  engine.signal(&id, "approve", Value::Null).await?;
  let address = engine
    .update(&id, "changeAddress", json!("2 Side St"))
    .await
    .context("address change failed")?;
  eprintln!("Address changed to {address}");
  eprintln!("Status: {}", engine.query(&id, "status", Value::Null).await?);

  engine.signal(&id, "ship", Value::Null).await?;
  match engine.update(&id, "changeAddress", json!("3 Late Ave")).await {
    Err(EngineError::Validation { reason }) => eprintln!("Late address change rejected: {reason}"),
    other => anyhow::bail!("expected late address change to be rejected, got {other:?}"),
  }

  engine.signal(&id, "deliver", Value::Null).await?;
  let outcome = engine.result(&id).await?;
  eprintln!("Outcome: {}", serde_json::to_string(&outcome)?);

  let history = engine.history(&id).await?;
  cancel.cancel();
  dispatcher.await.context("dispatcher task failed")?;
  Ok(history)
}
