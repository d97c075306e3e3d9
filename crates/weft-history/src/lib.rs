//! Weft History
//!
//! This crate provides the append-only event log that backs every workflow
//! run. The log is the only state the engine needs to survive a restart:
//! replaying a run's events reconstructs the run.
//!
//! The [`EventLog`] trait defines:
//! - Optimistic appends guarded by the caller's expected last sequence number
//! - Lazy, restartable reads from any sequence number
//! - Enumeration of stored runs for recovery
//!
//! Entries are keyed by `(workflow_id, run_id, sequence)`. Sequences start at
//! 1, increase strictly and are never reused.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryEventLog;
pub use sqlite::SqliteEventLog;
pub use types::{Event, EventKind, InstanceId, ParentClosePolicy, ParentRef, UpdateOutcome};

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};

/// A boxed stream of events, in sequence order.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = Result<Event, Error>> + Send + 'a>>;

/// Error type for event log operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The caller's view of the history is stale: another writer appended first.
  #[error("append conflict on {instance}: expected last sequence {expected}, found {actual}")]
  Conflict {
    instance: InstanceId,
    expected: u64,
    actual: u64,
  },

  /// The event's sequence number is not `expected + 1`.
  #[error("event sequence {sequence} does not follow {expected} on {instance}")]
  InvalidSequence {
    instance: InstanceId,
    expected: u64,
    sequence: u64,
  },

  /// The requested history does not exist.
  #[error("no history for {0}")]
  NotFound(InstanceId),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Running migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
  /// Whether retrying with a refreshed view may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Error::Conflict { .. } | Error::Database(_))
  }
}

/// Durable, append-only storage of workflow run histories.
#[async_trait]
pub trait EventLog: Send + Sync {
  /// Append `event` to the history of `instance`.
  ///
  /// `expected_last` is the sequence number of the caller's last known event
  /// (0 for an empty history) and `event.sequence` must be `expected_last + 1`.
  /// Fails with [`Error::Conflict`] if the stored tail differs. Once this
  /// returns `Ok`, the event is durable.
  async fn append(&self, instance: &InstanceId, expected_last: u64, event: &Event)
  -> Result<u64, Error>;

  /// Stream the events of `instance` whose sequence is `>= from`.
  ///
  /// The stream is finite and may be requested again to restart the read.
  fn read_from<'a>(&'a self, instance: &InstanceId, from: u64) -> EventStream<'a>;

  /// Sequence number of the last stored event, or 0.
  async fn last_sequence(&self, instance: &InstanceId) -> Result<u64, Error>;

  /// All runs that have at least one event.
  async fn instances(&self) -> Result<Vec<InstanceId>, Error>;

  /// Collect the full history of `instance`.
  async fn read_all(&self, instance: &InstanceId) -> Result<Vec<Event>, Error> {
    self.read_from(instance, 1).try_collect().await
  }
}

/// Check the sequence contract shared by every implementation.
pub(crate) fn check_sequence(
  instance: &InstanceId,
  expected_last: u64,
  actual: u64,
  event: &Event,
) -> Result<(), Error> {
  if actual != expected_last {
    return Err(Error::Conflict {
      instance: instance.clone(),
      expected: expected_last,
      actual,
    });
  }
  if event.sequence != expected_last + 1 {
    return Err(Error::InvalidSequence {
      instance: instance.clone(),
      expected: expected_last,
      sequence: event.sequence,
    });
  }
  Ok(())
}
