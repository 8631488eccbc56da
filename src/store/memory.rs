use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EventStore, StoreError};
use crate::types::{EventFilter, EventStatus, NewEvent, StatusCounts, WebhookEvent};

struct Row {
    seq: u64,
    event: WebhookEvent,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<Uuid, Row>,
    next_seq: u64,
}

/// Event store held entirely in memory. Lost on restart.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite `updated_at` on a row. Lets tests age an event.
    #[cfg(test)]
    pub async fn set_updated_at(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(row) = self.inner.write().await.rows.get_mut(&id) {
            row.event.updated_at = at;
        }
    }
}

fn sorted_by_seq<'a>(rows: impl Iterator<Item = &'a Row>) -> Vec<&'a Row> {
    let mut items: Vec<&Row> = rows.collect();
    items.sort_by_key(|r| r.seq);
    items
}

#[async_trait]
impl EventStore for MemoryEventStore {
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

        let mut inner = self.inner.write().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.rows.insert(
            event.id,
            Row {
                seq,
                event: event.clone(),
            },
        );
        Ok(event)
    }

    async fn select_pending(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(sorted_by_seq(inner.rows.values())
            .into_iter()
            .filter(|r| r.event.status == EventStatus::Pending)
            .take(limit)
            .map(|r| r.event.clone())
            .collect())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.rows.get(&id).map(|r| r.event.clone()))
    }

    async fn claim(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.rows.get_mut(&id) {
            Some(row) if row.event.status == EventStatus::Pending => {
                row.event.status = EventStatus::Processing;
                row.event.attempts += 1;
                row.event.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if row.event.status != EventStatus::Processing {
            return Err(StoreError::NotProcessing(id));
        }
        row.event.status = EventStatus::Completed;
        row.event.last_error = None;
        row.event.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if row.event.status != EventStatus::Processing {
            return Err(StoreError::NotProcessing(id));
        }
        row.event.status = EventStatus::Failed;
        row.event.last_error = Some(error.to_string());
        row.event.updated_at = Utc::now();
        Ok(())
    }

    async fn requeue_failed(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.rows.get_mut(&id) {
            Some(row) if row.event.status == EventStatus::Failed => {
                row.event.status = EventStatus::Pending;
                row.event.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut reaped: Vec<(u64, Uuid)> = Vec::new();
        for row in inner.rows.values_mut() {
            if row.event.status == EventStatus::Processing && row.event.updated_at < cutoff {
                row.event.status = EventStatus::Failed;
                row.event.last_error = Some(error.to_string());
                row.event.updated_at = now;
                reaped.push((row.seq, row.event.id));
            }
        }
        reaped.sort_by_key(|(seq, _)| *seq);
        Ok(reaped.into_iter().map(|(_, id)| id).collect())
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<WebhookEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(sorted_by_seq(inner.rows.values())
            .into_iter()
            .rev()
            .filter(|r| filter.status.map_or(true, |s| r.event.status == s))
            .take(filter.limit)
            .map(|r| r.event.clone())
            .collect())
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let inner = self.inner.read().await;
        let mut counts = StatusCounts::default();
        for row in inner.rows.values() {
            counts.add(row.event.status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn select_pending_is_oldest_first_and_bounded() {
        let store = MemoryEventStore::new();
        let a = store.insert(NewEvent::new("stripe", json!({"n": 1}))).await.unwrap();
        let b = store.insert(NewEvent::new("stripe", json!({"n": 2}))).await.unwrap();
        let _c = store.insert(NewEvent::new("stripe", json!({"n": 3}))).await.unwrap();

        let batch = store.select_pending(2).await.unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn claim_only_succeeds_once() {
        let store = MemoryEventStore::new();
        let ev = store.insert(NewEvent::new("thirdweb", json!({}))).await.unwrap();

        assert!(store.claim(ev.id).await.unwrap());
        assert!(!store.claim(ev.id).await.unwrap());

        let stored = store.find_by_id(ev.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processing);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn mark_completed_requires_processing() {
        let store = MemoryEventStore::new();
        let ev = store.insert(NewEvent::new("stripe", json!({}))).await.unwrap();

        let err = store.mark_completed(ev.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotProcessing(id) if id == ev.id));

        let err = store.mark_failed(Uuid::new_v4(), "boom").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn requeue_keeps_last_error() {
        let store = MemoryEventStore::new();
        let ev = store.insert(NewEvent::new("stripe", json!({}))).await.unwrap();
        store.claim(ev.id).await.unwrap();
        store.mark_failed(ev.id, "downstream 502").await.unwrap();

        assert!(store.requeue_failed(ev.id).await.unwrap());
        assert!(!store.requeue_failed(ev.id).await.unwrap());

        let stored = store.find_by_id(ev.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.last_error.as_deref(), Some("downstream 502"));
    }

    #[tokio::test]
    async fn list_filters_by_status_newest_first() {
        let store = MemoryEventStore::new();
        let a = store.insert(NewEvent::new("stripe", json!({}))).await.unwrap();
        let b = store.insert(NewEvent::new("stripe", json!({}))).await.unwrap();
        let c = store.insert(NewEvent::new("stripe", json!({}))).await.unwrap();
        store.claim(b.id).await.unwrap();

        let pending = store
            .list(&EventFilter {
                status: Some(EventStatus::Pending),
                limit: 10,
            })
            .await
            .unwrap();
        let ids: Vec<Uuid> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![c.id, a.id]);

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.processing, 1);
    }
}
