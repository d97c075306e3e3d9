use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::{Error, Event, EventLog, EventStream, InstanceId, check_sequence};

/// In-memory event log.
///
/// Histories live as long as the log value. Sharing one log between engine
/// instances (via `Arc`) models a process restart over durable storage.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
  histories: RwLock<BTreeMap<InstanceId, Vec<Event>>>,
}

impl MemoryEventLog {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of events stored across all runs.
  pub fn total_events(&self) -> usize {
    let histories = self.histories.read().unwrap_or_else(PoisonError::into_inner);
    histories.values().map(Vec::len).sum()
  }
}

#[async_trait]
impl EventLog for MemoryEventLog {
  async fn append(
    &self,
    instance: &InstanceId,
    expected_last: u64,
    event: &Event,
  ) -> Result<u64, Error> {
    let mut histories = self.histories.write().unwrap_or_else(PoisonError::into_inner);
    let history = histories.entry(instance.clone()).or_default();
    let actual = history.last().map_or(0, |e| e.sequence);
    check_sequence(instance, expected_last, actual, event)?;
    history.push(event.clone());
    Ok(event.sequence)
  }

  fn read_from<'a>(&'a self, instance: &InstanceId, from: u64) -> EventStream<'a> {
    let events: Vec<Result<Event, Error>> = {
      let histories = self.histories.read().unwrap_or_else(PoisonError::into_inner);
      histories
        .get(instance)
        .map(|h| h.iter().filter(|e| e.sequence >= from).cloned().map(Ok).collect())
        .unwrap_or_default()
    };
    Box::pin(futures::stream::iter(events))
  }

  async fn last_sequence(&self, instance: &InstanceId) -> Result<u64, Error> {
    let histories = self.histories.read().unwrap_or_else(PoisonError::into_inner);
    Ok(
      histories
        .get(instance)
        .and_then(|h| h.last())
        .map_or(0, |e| e.sequence),
    )
  }

  async fn instances(&self) -> Result<Vec<InstanceId>, Error> {
    let histories = self.histories.read().unwrap_or_else(PoisonError::into_inner);
    Ok(
      histories
        .iter()
        .filter(|(_, h)| !h.is_empty())
        .map(|(id, _)| id.clone())
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::EventKind;
  use chrono::Utc;
  use futures::TryStreamExt;

  fn signal(sequence: u64, name: &str) -> Event {
    Event::new(
      sequence,
      Utc::now(),
      EventKind::SignalReceived {
        name: name.to_string(),
        payload: serde_json::Value::Null,
      },
    )
  }

  #[tokio::test]
  async fn test_append_assigns_increasing_sequences() {
    let log = MemoryEventLog::new();
    let id = InstanceId::new("wf", "run");

    assert_eq!(log.append(&id, 0, &signal(1, "a")).await.unwrap(), 1);
    assert_eq!(log.append(&id, 1, &signal(2, "b")).await.unwrap(), 2);
    assert_eq!(log.last_sequence(&id).await.unwrap(), 2);
    assert_eq!(log.total_events(), 2);
  }

  #[tokio::test]
  async fn test_stale_expected_sequence_conflicts() {
    let log = MemoryEventLog::new();
    let id = InstanceId::new("wf", "run");
    log.append(&id, 0, &signal(1, "a")).await.unwrap();

    let err = log.append(&id, 0, &signal(1, "b")).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { expected: 0, actual: 1, .. }));
    assert!(err.is_retryable());

    // The losing write left no trace.
    let history = log.read_all(&id).await.unwrap();
    assert_eq!(history.len(), 1);
  }

  #[tokio::test]
  async fn test_read_from_is_restartable() {
    let log = MemoryEventLog::new();
    let id = InstanceId::new("wf", "run");
    for seq in 1..=4 {
      log.append(&id, seq - 1, &signal(seq, "s")).await.unwrap();
    }

    let tail: Vec<Event> = log.read_from(&id, 3).try_collect().await.unwrap();
    assert_eq!(tail.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4]);

    let again: Vec<Event> = log.read_from(&id, 3).try_collect().await.unwrap();
    assert_eq!(tail, again);
  }

  #[tokio::test]
  async fn test_histories_are_isolated() {
    let log = MemoryEventLog::new();
    let a = InstanceId::new("wf", "a");
    let b = InstanceId::new("wf", "b");
    log.append(&a, 0, &signal(1, "x")).await.unwrap();

    assert_eq!(log.last_sequence(&b).await.unwrap(), 0);
    assert_eq!(log.instances().await.unwrap(), vec![a]);
  }
}
