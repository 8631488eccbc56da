//! Scheduler-facing trigger for a processor pass.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::auth::{bearer_token, tokens_match};
use super::AppState;
use crate::error::PipelineError;

#[derive(Debug, Deserialize)]
pub struct CronQuery {
    batch_size: Option<usize>,
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(json!({ "ok": false, "error": error.into() }))).into_response()
}

fn paused() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "ok": false,
            "skipped": true,
            "processed": 0,
            "errors": 0,
            "error": PipelineError::ProcessingDisabled.to_string(),
        })),
    )
        .into_response()
}

/// Runs one batch. Responds `{ok, processed, errors, skipped}`.
///
/// A paused pipeline answers 503 with `skipped: true` so the scheduler can
/// tell it apart from an empty queue. Stale-row reaping is skipped as well,
/// so a paused pipeline leaves every event untouched.
pub async fn process_webhooks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Response {
    let authorized = bearer_token(&headers)
        .is_some_and(|token| tokens_match(token, &state.config.cron_secret));
    if !authorized {
        warn!("cron trigger rejected: bad or missing secret");
        return failure(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    if !state.processor.kill_switch().is_processing_enabled() {
        info!("kill switch engaged, skipping cron tick");
        return paused();
    }

    if let Some(older_than) = state.config.stale_after {
        if let Err(e) = state.reaper.reap(older_than).await {
            error!(error = %e, "stale event reaping failed");
        }
    }

    let batch_size = query.batch_size.unwrap_or(state.config.default_batch_size);
    match state.processor.process_pending_events(batch_size).await {
        Ok(summary) => Json(json!({
            "ok": true,
            "processed": summary.processed,
            "errors": summary.errors,
            "skipped": summary.skipped,
        }))
        .into_response(),
        Err(PipelineError::ProcessingDisabled) => paused(),
        Err(e @ PipelineError::InvalidBatchSize) => failure(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            error!(error = %e, "webhook batch failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
