use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::store::EventStore;

/// Fails events left in `processing` by a crashed or killed processor so an
/// operator can replay them.
///
/// Thresholds must exceed the processor's attempt timeout; a shorter one
/// would fail events whose handler is still running.
pub struct Reaper {
    store: Arc<dyn EventStore>,
    attempt_timeout: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn EventStore>, attempt_timeout: Duration) -> Self {
        Self {
            store,
            attempt_timeout,
        }
    }

    pub async fn reap(&self, older_than: Duration) -> Result<Vec<Uuid>, PipelineError> {
        if older_than <= self.attempt_timeout {
            return Err(PipelineError::InvalidThreshold(format!(
                "{}s must exceed the attempt timeout of {}s",
                older_than.as_secs(),
                self.attempt_timeout.as_secs()
            )));
        }
        let out_of_range =
            || PipelineError::InvalidThreshold(format!("{}s is out of range", older_than.as_secs()));
        let age = chrono::Duration::from_std(older_than).map_err(|_| out_of_range())?;
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .ok_or_else(out_of_range)?;
        let reason = format!("processing stalled for more than {}s", older_than.as_secs());

        let ids = self.store.reap_stale(cutoff, &reason).await?;
        if ids.is_empty() {
            info!(older_than_secs = older_than.as_secs(), "no stale events");
        } else {
            for id in &ids {
                warn!(event_id = %id, "stale processing event marked failed");
            }
            info!(reaped = ids.len(), "stale events reaped");
        }
        Ok(ids)
    }
}
