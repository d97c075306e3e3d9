//! Weft Workflow
//!
//! Deterministic execution of user-defined workflow logic.
//!
//! Workflow logic is an async function over a [`WorkflowContext`]. The
//! [`Scheduler`] drives it one pass at a time as history events are applied,
//! turning its awaits on activities, timers, children and conditions into
//! [`Command`]s for the engine to acknowledge and carry out. Replaying a
//! run's history through a fresh scheduler rebuilds exactly the same state,
//! handler registrations and pending work, without repeating side effects.
//!
//! Signal, update and query handlers are registered by the workflow logic
//! through the context and live in the instance's [`HandlerRegistry`].

mod command;
mod context;
mod error;
mod handler;
mod scheduler;
mod state;
mod status;
mod workflow;

pub use command::Command;
pub use context::{
  ActivityFuture, CancelledFuture, ChildFuture, ChildOptions, ConditionFuture, JoinChildren,
  TimerFuture, WaitPolicy, WorkflowContext, join_children,
};
pub use error::{HandlerError, SchedulerError, WorkflowError};
pub use handler::{HandlerKind, HandlerRegistry, UpdateHandler};
pub use scheduler::{PendingActivity, PendingChild, Scheduler, StartInfo};
pub use state::WorkflowState;
pub use status::{InstanceStatus, WorkflowOutcome};
pub use workflow::{
  FnWorkflow, StartAccess, StartDenied, Workflow, WorkflowFuture, WorkflowRegistry, workflow_fn,
};
