use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

use crate::{Error, Event, EventKind, EventLog, EventStream, InstanceId, check_sequence};

/// SQLite-based event log.
pub struct SqliteEventLog {
  pool: SqlitePool,
}

#[derive(FromRow)]
struct EventRow {
  sequence: i64,
  payload: Json<EventKind>,
  recorded_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
  fn from(row: EventRow) -> Self {
    Event::new(row.sequence as u64, row.recorded_at, row.payload.0)
  }
}

impl SqliteEventLog {
  /// Create a new SQLite event log with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) a database file and run migrations.
  pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let log = Self::new(pool);
    log.migrate().await?;
    Ok(log)
  }

  /// A private in-memory database, mainly for tests.
  pub async fn in_memory() -> Result<Self, Error> {
    // Every connection to `sqlite::memory:` is a separate database.
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect("sqlite::memory:")
      .await?;
    let log = Self::new(pool);
    log.migrate().await?;
    Ok(log)
  }

  /// Close every pooled connection.
  pub async fn close(&self) {
    self.pool.close().await;
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }
}

#[async_trait]
impl EventLog for SqliteEventLog {
  async fn append(
    &self,
    instance: &InstanceId,
    expected_last: u64,
    event: &Event,
  ) -> Result<u64, Error> {
    let mut tx = self.pool.begin().await?;

    let actual: i64 = sqlx::query_scalar(
      r#"
            SELECT COALESCE(MAX(sequence), 0)
            FROM workflow_events
            WHERE workflow_id = ? AND run_id = ?
            "#,
    )
    .bind(&instance.workflow_id)
    .bind(&instance.run_id)
    .fetch_one(&mut *tx)
    .await?;

    check_sequence(instance, expected_last, actual as u64, event)?;

    let inserted = sqlx::query(
      r#"
            INSERT INTO workflow_events (workflow_id, run_id, sequence, kind, payload, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&instance.workflow_id)
    .bind(&instance.run_id)
    .bind(event.sequence as i64)
    .bind(event.kind.name())
    .bind(Json(&event.kind))
    .bind(event.timestamp)
    .execute(&mut *tx)
    .await;

    match inserted {
      Ok(_) => {}
      Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
        return Err(Error::Conflict {
          instance: instance.clone(),
          expected: expected_last,
          actual: expected_last + 1,
        });
      }
      Err(e) => return Err(e.into()),
    }

    tx.commit().await?;
    Ok(event.sequence)
  }

  fn read_from<'a>(&'a self, instance: &InstanceId, from: u64) -> EventStream<'a> {
    let rows = sqlx::query_as::<_, EventRow>(
      r#"
            SELECT sequence, payload, recorded_at
            FROM workflow_events
            WHERE workflow_id = ? AND run_id = ? AND sequence >= ?
            ORDER BY sequence ASC
            "#,
    )
    .bind(instance.workflow_id.clone())
    .bind(instance.run_id.clone())
    .bind(from as i64)
    .fetch(&self.pool);

    Box::pin(rows.map(|row| row.map(Event::from).map_err(Error::from)))
  }

  async fn last_sequence(&self, instance: &InstanceId) -> Result<u64, Error> {
    let last: i64 = sqlx::query_scalar(
      r#"
            SELECT COALESCE(MAX(sequence), 0)
            FROM workflow_events
            WHERE workflow_id = ? AND run_id = ?
            "#,
    )
    .bind(&instance.workflow_id)
    .bind(&instance.run_id)
    .fetch_one(&self.pool)
    .await?;

    Ok(last as u64)
  }

  async fn instances(&self) -> Result<Vec<InstanceId>, Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(
      r#"
            SELECT workflow_id, run_id
            FROM workflow_events
            WHERE sequence = 1
            ORDER BY recorded_at ASC, workflow_id ASC
            "#,
    )
    .fetch_all(&self.pool)
    .await?;

    Ok(
      rows
        .into_iter()
        .map(|(workflow_id, run_id)| InstanceId::new(workflow_id, run_id))
        .collect(),
    )
  }
}
