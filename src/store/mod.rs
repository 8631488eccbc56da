//! Persistence for webhook events.
//!
//! Every status mutation is a conditional update keyed on the current status,
//! so two processors racing on one row cannot both claim it.

mod memory;
mod sqlite;

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{EventFilter, NewEvent, StatusCounts, WebhookEvent};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("event not found: {0}")]
    NotFound(Uuid),

    #[error("event {0} is not being processed")]
    NotProcessing(Uuid),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Record a new event with status `pending`.
    async fn insert(&self, event: NewEvent) -> Result<WebhookEvent, StoreError>;

    /// Pending events, oldest first, at most `limit`.
    async fn select_pending(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError>;

    /// `pending -> processing`, incrementing `attempts`. Returns `false` when
    /// the row is missing or no longer pending.
    async fn claim(&self, id: Uuid) -> Result<bool, StoreError>;

    /// `processing -> completed`, clearing `last_error`. Any other current
    /// status is `StoreError::NotProcessing`.
    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError>;

    /// `processing -> failed` with the given reason.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// `failed -> pending`. `last_error` is kept. Returns `false` when the row
    /// is missing or not failed.
    async fn requeue_failed(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Moves `processing` rows last touched before `cutoff` to `failed`.
    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &EventFilter) -> Result<Vec<WebhookEvent>, StoreError>;

    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;
}
