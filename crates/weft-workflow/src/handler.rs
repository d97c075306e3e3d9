//! Per-instance registry of signal, update and query handlers.
//!
//! Handlers are registered by the workflow logic itself, so replaying the
//! logic re-creates the same registrations in the same order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HandlerError;
use crate::state::WorkflowState;

/// The three kinds of inbound messages a workflow can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
  Signal,
  Update,
  Query,
}

impl fmt::Display for HandlerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      HandlerKind::Signal => write!(f, "signal"),
      HandlerKind::Update => write!(f, "update"),
      HandlerKind::Query => write!(f, "query"),
    }
  }
}

pub type SignalFn = Arc<dyn Fn(&mut WorkflowState, Value) -> Result<(), String> + Send + Sync>;
pub type ValidatorFn = Arc<dyn Fn(&WorkflowState, &Value) -> Result<(), String> + Send + Sync>;
pub type MutatorFn = Arc<dyn Fn(&mut WorkflowState, Value) -> Result<Value, String> + Send + Sync>;
pub type QueryFn = Arc<dyn Fn(&WorkflowState, &Value) -> Result<Value, String> + Send + Sync>;

/// A two-phase update handler.
///
/// The validator runs first against the current state and must not mutate
/// it. Only a validated update is recorded as accepted and reaches the
/// mutator.
#[derive(Clone)]
pub struct UpdateHandler {
  pub(crate) validator: Option<ValidatorFn>,
  pub(crate) mutator: MutatorFn,
}

impl UpdateHandler {
  pub fn new<F>(mutator: F) -> Self
  where
    F: Fn(&mut WorkflowState, Value) -> Result<Value, String> + Send + Sync + 'static,
  {
    Self {
      validator: None,
      mutator: Arc::new(mutator),
    }
  }

  pub fn validator<F>(mut self, validator: F) -> Self
  where
    F: Fn(&WorkflowState, &Value) -> Result<(), String> + Send + Sync + 'static,
  {
    self.validator = Some(Arc::new(validator));
    self
  }

  pub fn validate(&self, state: &WorkflowState, payload: &Value) -> Result<(), String> {
    match &self.validator {
      Some(validator) => validator(state, payload),
      None => Ok(()),
    }
  }
}

impl fmt::Debug for UpdateHandler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UpdateHandler")
      .field("validator", &self.validator.is_some())
      .finish_non_exhaustive()
  }
}

/// Handlers registered by one workflow instance.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
  signals: HashMap<String, SignalFn>,
  updates: HashMap<String, UpdateHandler>,
  queries: HashMap<String, QueryFn>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register_signal(&mut self, name: &str, handler: SignalFn) -> Result<(), HandlerError> {
    insert_unique(&mut self.signals, name, HandlerKind::Signal, handler)
  }

  pub fn register_update(
    &mut self,
    name: &str,
    handler: UpdateHandler,
  ) -> Result<(), HandlerError> {
    insert_unique(&mut self.updates, name, HandlerKind::Update, handler)
  }

  pub fn register_query(&mut self, name: &str, handler: QueryFn) -> Result<(), HandlerError> {
    insert_unique(&mut self.queries, name, HandlerKind::Query, handler)
  }

  pub fn signal(&self, name: &str) -> Option<SignalFn> {
    self.signals.get(name).cloned()
  }

  pub fn update(&self, name: &str) -> Option<UpdateHandler> {
    self.updates.get(name).cloned()
  }

  pub fn query(&self, name: &str) -> Option<QueryFn> {
    self.queries.get(name).cloned()
  }

  pub fn contains(&self, name: &str, kind: HandlerKind) -> bool {
    match kind {
      HandlerKind::Signal => self.signals.contains_key(name),
      HandlerKind::Update => self.updates.contains_key(name),
      HandlerKind::Query => self.queries.contains_key(name),
    }
  }
}

impl fmt::Debug for HandlerRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut signals: Vec<_> = self.signals.keys().collect();
    let mut updates: Vec<_> = self.updates.keys().collect();
    let mut queries: Vec<_> = self.queries.keys().collect();
    signals.sort();
    updates.sort();
    queries.sort();
    f.debug_struct("HandlerRegistry")
      .field("signals", &signals)
      .field("updates", &updates)
      .field("queries", &queries)
      .finish()
  }
}

fn insert_unique<H>(
  map: &mut HashMap<String, H>,
  name: &str,
  kind: HandlerKind,
  handler: H,
) -> Result<(), HandlerError> {
  if map.contains_key(name) {
    return Err(HandlerError::Duplicate {
      name: name.to_string(),
      kind,
    });
  }
  map.insert(name.to_string(), handler);
  Ok(())
}
