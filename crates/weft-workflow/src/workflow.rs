//! Workflow definitions and the registry the engine resolves them from.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;

/// The future returned by running workflow logic.
pub type WorkflowFuture = BoxFuture<'static, Result<Value, WorkflowError>>;

/// User-defined workflow logic.
///
/// `run` must be deterministic given the events delivered through `ctx`:
/// every wall-clock read, random value or external call goes through the
/// context. The returned future is only ever polled by the scheduler and
/// must not await anything that relies on a waker (tokio timers, channels,
/// `FuturesUnordered`).
pub trait Workflow: Send + Sync {
  fn workflow_type(&self) -> &str;

  fn run(&self, ctx: WorkflowContext, input: Value) -> WorkflowFuture;
}

/// A [`Workflow`] backed by an async closure.
pub struct FnWorkflow<F> {
  workflow_type: String,
  func: F,
}

/// Wrap an async closure as a [`Workflow`].
pub fn workflow_fn<F, Fut>(workflow_type: impl Into<String>, func: F) -> FnWorkflow<F>
where
  F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
{
  FnWorkflow {
    workflow_type: workflow_type.into(),
    func,
  }
}

impl<F, Fut> Workflow for FnWorkflow<F>
where
  F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
{
  fn workflow_type(&self) -> &str {
    &self.workflow_type
  }

  fn run(&self, ctx: WorkflowContext, input: Value) -> WorkflowFuture {
    Box::pin((self.func)(ctx, input))
  }
}

/// Who may start a registered workflow type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartAccess {
  /// Anyone, top-level or as a child.
  Public,
  /// Only as a child. An empty allow-list admits any parent type.
  Private { allowed_parents: Vec<String> },
}

struct Registration {
  workflow: Arc<dyn Workflow>,
  access: StartAccess,
}

/// Error returned when a start is not permitted for a workflow type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartDenied {
  #[error("unknown workflow type '{0}'")]
  UnknownType(String),

  #[error("workflow '{workflow_type}' is private and can only be started by a parent workflow")]
  MissingParent { workflow_type: String },

  #[error("workflow '{workflow_type}' cannot be started by parent type '{parent_type}'")]
  ParentNotAllowed {
    workflow_type: String,
    parent_type: String,
  },
}

/// Registry of workflow types known to an engine.
#[derive(Default)]
pub struct WorkflowRegistry {
  workflows: HashMap<String, Registration>,
}

impl WorkflowRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a workflow anyone may start. Re-registering a type replaces it.
  pub fn register(&mut self, workflow: impl Workflow + 'static) -> &mut Self {
    self.insert(Arc::new(workflow), StartAccess::Public)
  }

  /// Register a workflow that may only run as a child of a workflow whose
  /// type is in `allowed_parents` (or of any workflow, if the list is empty).
  pub fn register_private<I, S>(
    &mut self,
    workflow: impl Workflow + 'static,
    allowed_parents: I,
  ) -> &mut Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let allowed_parents = allowed_parents.into_iter().map(Into::into).collect();
    self.insert(Arc::new(workflow), StartAccess::Private { allowed_parents })
  }

  fn insert(&mut self, workflow: Arc<dyn Workflow>, access: StartAccess) -> &mut Self {
    let workflow_type = workflow.workflow_type().to_string();
    self
      .workflows
      .insert(workflow_type, Registration { workflow, access });
    self
  }

  pub fn get(&self, workflow_type: &str) -> Option<Arc<dyn Workflow>> {
    self
      .workflows
      .get(workflow_type)
      .map(|r| Arc::clone(&r.workflow))
  }

  pub fn access(&self, workflow_type: &str) -> Option<&StartAccess> {
    self.workflows.get(workflow_type).map(|r| &r.access)
  }

  pub fn contains(&self, workflow_type: &str) -> bool {
    self.workflows.contains_key(workflow_type)
  }

  /// Check whether `workflow_type` may be started by a parent of
  /// `parent_type` (`None` for a top-level start).
  pub fn authorize_start(
    &self,
    workflow_type: &str,
    parent_type: Option<&str>,
  ) -> Result<Arc<dyn Workflow>, StartDenied> {
    let registration = self
      .workflows
      .get(workflow_type)
      .ok_or_else(|| StartDenied::UnknownType(workflow_type.to_string()))?;

    if let StartAccess::Private { allowed_parents } = &registration.access {
      let Some(parent_type) = parent_type else {
        return Err(StartDenied::MissingParent {
          workflow_type: workflow_type.to_string(),
        });
      };
      if !allowed_parents.is_empty() && !allowed_parents.iter().any(|p| p == parent_type) {
        return Err(StartDenied::ParentNotAllowed {
          workflow_type: workflow_type.to_string(),
          parent_type: parent_type.to_string(),
        });
      }
    }

    Ok(Arc::clone(&registration.workflow))
  }
}
