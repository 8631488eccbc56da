//! Batch processor for pending webhook events.
//!
//! One call drains at most `batch_size` pending events, oldest first. Each
//! event is claimed with a conditional update before its handler runs, so
//! overlapping cron ticks never deliver the same event twice. A failing or
//! hung event is recorded as `failed` and the batch moves on.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::handler::EventHandler;
use crate::kill_switch::KillSwitch;
use crate::store::EventStore;
use crate::types::{BatchSummary, WebhookEvent};

pub struct Processor {
    store: Arc<dyn EventStore>,
    handler: Arc<dyn EventHandler>,
    kill_switch: KillSwitch,
    attempt_timeout: Duration,
    max_batch_size: usize,
}

enum Outcome {
    Completed,
    Failed,
    Skipped,
}

impl Processor {
    pub fn new(
        store: Arc<dyn EventStore>,
        handler: Arc<dyn EventHandler>,
        kill_switch: KillSwitch,
        attempt_timeout: Duration,
        max_batch_size: usize,
    ) -> Self {
        Self {
            store,
            handler,
            kill_switch,
            attempt_timeout,
            max_batch_size: max_batch_size.max(1),
        }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub async fn process_pending_events(
        &self,
        batch_size: usize,
    ) -> Result<BatchSummary, PipelineError> {
        if batch_size == 0 {
            return Err(PipelineError::InvalidBatchSize);
        }
        if !self.kill_switch.is_processing_enabled() {
            info!("kill switch engaged, skipping webhook batch");
            return Err(PipelineError::ProcessingDisabled);
        }
        self.handler.check_ready()?;

        let limit = batch_size.min(self.max_batch_size);
        let events = self.store.select_pending(limit).await?;
        debug!(batch_size = limit, selected = events.len(), "selected pending events");

        let mut summary = BatchSummary::default();
        for event in &events {
            match self.process_one(event).await {
                Outcome::Completed => summary.processed += 1,
                Outcome::Failed => summary.errors += 1,
                Outcome::Skipped => summary.skipped += 1,
            }
        }

        info!(
            processed = summary.processed,
            errors = summary.errors,
            skipped = summary.skipped,
            "webhook batch finished"
        );
        Ok(summary)
    }

    async fn process_one(&self, event: &WebhookEvent) -> Outcome {
        match self.store.claim(event.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(event_id = %event.id, "event already claimed, skipping");
                return Outcome::Skipped;
            }
            Err(e) => {
                error!(event_id = %event.id, error = %e, "failed to claim event");
                return Outcome::Failed;
            }
        }

        // The claim bumped attempts; hand the handler the row as it now stands.
        let mut claimed = event.clone();
        claimed.attempts += 1;

        let result = tokio::time::timeout(self.attempt_timeout, self.handler.handle(&claimed)).await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "timed out after {}s",
                self.attempt_timeout.as_secs_f64()
            )),
        };

        match failure {
            None => match self.store.mark_completed(event.id).await {
                Ok(()) => {
                    debug!(event_id = %event.id, attempts = claimed.attempts, "event completed");
                    Outcome::Completed
                }
                Err(e) => {
                    error!(event_id = %event.id, error = %e, "failed to record completion");
                    Outcome::Failed
                }
            },
            Some(reason) => {
                warn!(
                    event_id = %event.id,
                    source = %event.source,
                    attempts = claimed.attempts,
                    error = %reason,
                    "event processing failed"
                );
                if let Err(e) = self.store.mark_failed(event.id, &reason).await {
                    error!(event_id = %event.id, error = %e, "failed to record failure");
                }
                Outcome::Failed
            }
        }
    }
}
