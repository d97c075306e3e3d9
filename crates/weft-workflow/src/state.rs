//! Instance-local workflow state.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Key/value state owned by one workflow instance.
///
/// Handlers and workflow logic read and mutate it; queries only read it.
/// It is never persisted directly: replaying the history rebuilds it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowState {
  values: Map<String, Value>,
}

impl WorkflowState {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get_value(&self, key: &str) -> Option<&Value> {
    self.values.get(key)
  }

  /// Typed read. Missing keys and shape mismatches both read as `None`.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self
      .values
      .get(key)
      .and_then(|v| serde_json::from_value(v.clone()).ok())
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.values.get(key).and_then(Value::as_str)
  }

  pub fn get_bool(&self, key: &str) -> bool {
    self
      .values
      .get(key)
      .and_then(Value::as_bool)
      .unwrap_or(false)
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.values.insert(key.into(), value.into());
  }

  /// Store any serializable value. Values that fail to serialize are stored as null.
  pub fn set_serialized<T: Serialize>(&mut self, key: impl Into<String>, value: &T) {
    let value = serde_json::to_value(value).unwrap_or(Value::Null);
    self.values.insert(key.into(), value);
  }

  pub fn remove(&mut self, key: &str) -> Option<Value> {
    self.values.remove(key)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.values.contains_key(key)
  }

  /// The whole state as a JSON object.
  pub fn snapshot(&self) -> Value {
    Value::Object(self.values.clone())
  }
}
