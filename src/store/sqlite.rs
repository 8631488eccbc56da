//! SQLite-backed event store.
//!
//! rusqlite is synchronous, so every call runs on `spawn_blocking` against a
//! single connection guarded by a mutex. Creation order is the `seq` rowid,
//! not the timestamp.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{EventStore, StoreError};
use crate::types::{EventFilter, EventStatus, NewEvent, StatusCounts, WebhookEvent};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS webhook_events (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    id         TEXT NOT NULL UNIQUE,
    source     TEXT NOT NULL,
    event_type TEXT,
    status     TEXT NOT NULL
               CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    payload    TEXT NOT NULL,
    attempts   INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_webhook_events_status_seq
    ON webhook_events (status, seq);
";

const COLUMNS: &str =
    "id, source, event_type, status, payload, attempts, last_error, created_at, updated_at";

pub struct SqliteEventStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!(
                        "failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        info!(path = %path.display(), journal_mode = %journal_mode, "opened event store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Corrupt("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed width so lexical comparison in SQL matches time order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

struct RawRow {
    id: String,
    source: String,
    event_type: Option<String>,
    status: String,
    payload: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source: row.get(1)?,
            event_type: row.get(2)?,
            status: row.get(3)?,
            payload: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_event(self) -> Result<WebhookEvent, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("bad id {:?}: {e}", self.id)))?;
        let status = self
            .status
            .parse::<EventStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| StoreError::Corrupt(format!("bad payload for {id}: {e}")))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| StoreError::Corrupt(format!("bad attempts for {id}: {}", self.attempts)))?;
        Ok(WebhookEvent {
            id,
            source: self.source,
            event_type: self.event_type,
            status,
            payload,
            attempts,
            last_error: self.last_error,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<RawRow>>,
) -> Result<Vec<WebhookEvent>, StoreError> {
    rows.map(|raw| raw?.into_event()).collect()
}

fn find(conn: &Connection, id: Uuid) -> Result<Option<WebhookEvent>, StoreError> {
    let sql = format!("SELECT {COLUMNS} FROM webhook_events WHERE id = ?1");
    conn.query_row(&sql, params![id.to_string()], RawRow::from_row)
        .optional()?
        .map(RawRow::into_event)
        .transpose()
}

/// Applies a `processing -> target` update, distinguishing a missing row
/// from one in the wrong state.
fn finish(
    conn: &Connection,
    id: Uuid,
    status: EventStatus,
    last_error: Option<&str>,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE webhook_events
            SET status = ?1, last_error = ?2, updated_at = ?3
          WHERE id = ?4 AND status = 'processing'",
        params![status.as_str(), last_error, timestamp(Utc::now()), id.to_string()],
    )?;
    if changed == 1 {
        return Ok(());
    }
    match find(conn, id)? {
        Some(_) => Err(StoreError::NotProcessing(id)),
        None => Err(StoreError::NotFound(id)),
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn insert(&self, new: NewEvent) -> Result<WebhookEvent, StoreError> {
        let now = Utc::now();
        let event = WebhookEvent {
            id: Uuid::new_v4(),
            source: new.source,
            event_type: new.event_type,
            status: EventStatus::Pending,
            payload: new.payload,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| StoreError::Corrupt(format!("unserializable payload: {e}")))?;

        let row = event.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO webhook_events
                    (id, source, event_type, status, payload, attempts, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6, ?6)",
                params![
                    row.id.to_string(),
                    row.source,
                    row.event_type,
                    row.status.as_str(),
                    payload,
                    timestamp(row.created_at),
                ],
            )?;
            Ok(())
        })
        .await?;

        debug!(event_id = %event.id, source = %event.source, "event stored");
        Ok(event)
    }

    async fn select_pending(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM webhook_events
                  WHERE status = 'pending'
                  ORDER BY seq ASC
                  LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit], RawRow::from_row)?;
            collect_events(rows)
        })
        .await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError> {
        self.with_conn(move |conn| find(conn, id)).await
    }

    async fn claim(&self, id: Uuid) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE webhook_events
                    SET status = 'processing', attempts = attempts + 1, updated_at = ?1
                  WHERE id = ?2 AND status = 'pending'",
                params![timestamp(Utc::now()), id.to_string()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_conn(move |conn| finish(conn, id, EventStatus::Completed, None))
            .await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let error = error.to_string();
        self.with_conn(move |conn| finish(conn, id, EventStatus::Failed, Some(&error)))
            .await
    }

    async fn requeue_failed(&self, id: Uuid) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE webhook_events
                    SET status = 'pending', updated_at = ?1
                  WHERE id = ?2 AND status = 'failed'",
                params![timestamp(Utc::now()), id.to_string()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let error = error.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let cutoff = timestamp(cutoff);
            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM webhook_events
                      WHERE status = 'processing' AND updated_at < ?1
                      ORDER BY seq ASC",
                )?;
                let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            tx.execute(
                "UPDATE webhook_events
                    SET status = 'failed', last_error = ?1, updated_at = ?2
                  WHERE status = 'processing' AND updated_at < ?3",
                params![error, timestamp(Utc::now()), cutoff],
            )?;
            tx.commit()?;

            ids.into_iter()
                .map(|id| {
                    Uuid::parse_str(&id)
                        .map_err(|e| StoreError::Corrupt(format!("bad id {id:?}: {e}")))
                })
                .collect()
        })
        .await
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<WebhookEvent>, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM webhook_events
                  WHERE (?1 IS NULL OR status = ?1)
                  ORDER BY seq DESC
                  LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![status, limit], RawRow::from_row)?;
            collect_events(rows)
        })
        .await
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM webhook_events GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = StatusCounts::default();
            for row in rows {
                let (status, n) = row?;
                let status = status
                    .parse::<EventStatus>()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                counts.add(status, n.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }
}
