use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::store::EventStore;
use crate::types::WebhookEvent;

/// Puts a single failed event back on the queue for the next processor pass.
///
/// Callers are expected to have authorized the operator already; this only
/// guards the state transition.
pub struct ReplayController {
    store: Arc<dyn EventStore>,
}

impl ReplayController {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn retry_event(&self, id: Uuid) -> Result<WebhookEvent, PipelineError> {
        if !self.store.requeue_failed(id).await? {
            return match self.store.find_by_id(id).await? {
                None => Err(PipelineError::NotFound(id)),
                Some(event) => Err(PipelineError::InvalidState {
                    id,
                    status: event.status,
                }),
            };
        }

        let event = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(PipelineError::NotFound(id))?;
        info!(event_id = %id, attempts = event.attempts, "event requeued for replay");
        Ok(event)
    }
}
