//! Weft Workflow Engine
//!
//! Durable execution for workflows written against `weft-workflow`. Every
//! run is an append-only history in an [`EventLog`](weft_history::EventLog);
//! in-memory state is rebuilt by replaying it, so a run survives restarts
//! and picks up its outstanding work on [`Engine::recover`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │  - start_workflow / signal / update / query / cancel        │
//! │  - one lock per instance, events admitted one at a time     │
//! │  - append to event log, then apply to the scheduler         │
//! └─────────────────────────────────────────────────────────────┘
//!                               │ outbound (mpsc)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │  - start(cancel) runs the loop, one task per message        │
//! │  - activities, timers, child starts, parent reports         │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ActivityExecutor                         │
//! │  - timeout and retry per activity options                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use weft_engine::{ActivityWorker, Engine, StartRequest};
//! use weft_workflow::{WorkflowRegistry, workflow_fn};
//!
//! let mut workflows = WorkflowRegistry::new();
//! workflows.register(workflow_fn("greet", |ctx, input| async move {
//!     ctx.activity("say_hello", input).await
//! }));
//!
//! let mut worker = ActivityWorker::new();
//! worker.register("say_hello", |input| async move { Ok(input) });
//!
//! let engine = Engine::builder().workflows(workflows).activities(worker).build();
//! engine.start(CancellationToken::new())?;
//!
//! let id = engine.start_workflow(StartRequest::new("greet-1", "greet", json!("hi"))).await?;
//! let outcome = engine.result(&id).await?;
//! ```

mod activity;
mod coordinator;
mod dispatcher;
mod engine;
mod error;
mod instance;
mod schedule;

pub use activity::{ActivityExecutor, ActivityFailure, ActivityRequest, ActivityWorker};
pub use engine::{Engine, EngineBuilder, HISTORY_LIMIT_MESSAGE, StartRequest};
pub use error::EngineError;
pub use schedule::ScheduleTrigger;
