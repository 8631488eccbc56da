//! Operator tooling: inspect events, replay failures, reap stuck rows and
//! flip the kill switch.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::AppState;
use crate::error::ApiError;
use crate::types::{EventFilter, EventStatus, WebhookEvent};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Literal the operator must send to flip the kill switch.
pub const CONFIRMATION_TOKEN: &str = "CONFIRM";

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("event {raw} not found")))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventList {
    events: Vec<WebhookEvent>,
    count: usize,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<EventList>, ApiError> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<EventStatus>())
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let filter = EventFilter {
        status,
        limit: query
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT),
    };

    let events = state.store.list(&filter).await?;
    Ok(Json(EventList {
        count: events.len(),
        events,
    }))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let counts = state.store.status_counts().await?;
    Ok(Json(json!({
        "counts": counts,
        "processing_enabled": state.processor.kill_switch().is_processing_enabled(),
    })))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WebhookEvent>, ApiError> {
    let id = parse_id(&id)?;
    state
        .store
        .find_by_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("event {id} not found")))
}

pub async fn replay_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let event = state.replay.retry_event(id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Event queued for retry",
        "event": event,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ReapQuery {
    older_than_secs: Option<u64>,
}

pub async fn reap(
    State(state): State<AppState>,
    Query(query): Query<ReapQuery>,
) -> Result<Json<Value>, ApiError> {
    let older_than = query
        .older_than_secs
        .map(Duration::from_secs)
        .or(state.config.stale_after)
        .ok_or_else(|| {
            ApiError::BadRequest(
                "older_than_secs is required when WEBHOOK_STALE_AFTER_SECS is unset".into(),
            )
        })?;

    let ids = state.reaper.reap(older_than).await?;
    Ok(Json(json!({
        "success": true,
        "reaped": ids.len(),
        "ids": ids,
    })))
}

pub async fn get_kill_switch(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "enabled": state.processor.kill_switch().is_processing_enabled(),
        "configured": state.config.processing_enabled,
    }))
}

#[derive(Debug, Deserialize)]
pub struct KillSwitchRequest {
    enabled: bool,
    #[serde(default)]
    confirm: Option<String>,
}

/// Applies the requested position to this process only.
pub async fn set_kill_switch(
    State(state): State<AppState>,
    Json(request): Json<KillSwitchRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.confirm.as_deref() != Some(CONFIRMATION_TOKEN) {
        return Err(ApiError::BadRequest(format!(
            "confirm must be \"{CONFIRMATION_TOKEN}\""
        )));
    }

    let switch = state.processor.kill_switch();
    let previous = switch.set(request.enabled);
    if request.enabled {
        info!(previous, "webhook processing enabled by operator");
    } else {
        warn!(previous, "webhook processing disabled by operator");
    }

    Ok(Json(json!({
        "success": true,
        "enabled": switch.is_processing_enabled(),
        "previous": previous,
        "warning": format!(
            "Change applies to this process only. Set WEBHOOK_PROCESSING_ENABLED={} to keep it across restarts.",
            request.enabled
        ),
    })))
}

#[cfg(test)]
mod tests {
    use super::super::router;
    use super::super::test_support::*;
    use super::*;
    use axum::http::StatusCode;
    use chrono::Utc;
    use tower::ServiceExt;

    use crate::store::EventStore;
    use crate::types::NewEvent;

    #[tokio::test]
    async fn replay_follows_state_rules() {
        let h = harness(&[]);
        let failed = h.store.insert(NewEvent::new("stripe", json!({}))).await.unwrap();
        h.store.claim(failed.id).await.unwrap();
        h.store.mark_failed(failed.id, "502 from downstream").await.unwrap();
        let pending = h.store.insert(NewEvent::new("stripe", json!({}))).await.unwrap();
        let app = router(h.state);

        let uri = format!("/api/admin/webhook-events/{}/replay", failed.id);
        let ok = app
            .clone()
            .oneshot(admin_request("POST", &uri, None))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = json_body(ok).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["event"]["status"], "pending");
        assert_eq!(body["event"]["last_error"], "502 from downstream");

        let again = app
            .clone()
            .oneshot(admin_request("POST", &uri, None))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);

        let uri = format!("/api/admin/webhook-events/{}/replay", pending.id);
        let not_failed = app
            .clone()
            .oneshot(admin_request("POST", &uri, None))
            .await
            .unwrap();
        assert_eq!(not_failed.status(), StatusCode::BAD_REQUEST);
        let body = json_body(not_failed).await;
        assert!(body["message"]
            .as_str()
            .unwrap()
            .starts_with("Event is not in failed state"));

        for missing in [Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
            let uri = format!("/api/admin/webhook-events/{missing}/replay");
            let response = app
                .clone()
                .oneshot(admin_request("POST", &uri, None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn list_and_get_events() {
        let h = harness(&[]);
        let a = h.store.insert(NewEvent::new("stripe", json!({"a": 1}))).await.unwrap();
        let b = h.store.insert(NewEvent::new("discord", json!({"b": 2}))).await.unwrap();
        h.store.claim(b.id).await.unwrap();
        h.store.mark_failed(b.id, "boom").await.unwrap();
        let app = router(h.state);

        let response = app
            .clone()
            .oneshot(admin_request(
                "GET",
                "/api/admin/webhook-events?status=failed",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["events"][0]["id"], b.id.to_string());
        assert_eq!(body["events"][0]["last_error"], "boom");

        let response = app
            .clone()
            .oneshot(admin_request(
                "GET",
                "/api/admin/webhook-events?status=bogus",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let uri = format!("/api/admin/webhook-events/{}", a.id);
        let response = app
            .clone()
            .oneshot(admin_request("GET", &uri, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["source"], "stripe");
        assert_eq!(body["payload"], json!({"a": 1}));

        let response = app
            .oneshot(admin_request("GET", "/api/admin/webhook-events/stats", None))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["counts"]["pending"], 1);
        assert_eq!(body["counts"]["failed"], 1);
        assert_eq!(body["processing_enabled"], true);
    }

    #[tokio::test]
    async fn kill_switch_requires_confirmation() {
        let h = harness(&[]);
        let switch = h.state.processor.kill_switch().clone();
        let app = router(h.state);

        let response = app
            .clone()
            .oneshot(admin_request(
                "POST",
                "/api/admin/kill-switch",
                Some(json!({ "enabled": false, "confirm": "confirm" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(switch.is_processing_enabled());

        let response = app
            .oneshot(admin_request(
                "POST",
                "/api/admin/kill-switch",
                Some(json!({ "enabled": false, "confirm": "CONFIRM" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["enabled"], false);
        assert_eq!(body["previous"], true);
        assert!(body["warning"]
            .as_str()
            .unwrap()
            .contains("WEBHOOK_PROCESSING_ENABLED=false"));
        assert!(!switch.is_processing_enabled());
    }

    #[tokio::test]
    async fn reap_needs_a_threshold() {
        let h = harness(&[]);
        let stuck = h.store.insert(NewEvent::new("stripe", json!({}))).await.unwrap();
        h.store.claim(stuck.id).await.unwrap();
        h.store
            .set_updated_at(stuck.id, Utc::now() - chrono::Duration::hours(2))
            .await;
        let app = router(h.state);

        let response = app
            .clone()
            .oneshot(admin_request("POST", "/api/admin/webhook-events/reap", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(admin_request(
                "POST",
                "/api/admin/webhook-events/reap?older_than_secs=3600",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["reaped"], 1);
        assert_eq!(body["ids"][0], stuck.id.to_string());
    }

    #[tokio::test]
    async fn reap_rejects_unsafe_thresholds() {
        let h = harness(&[]);
        let running = h.store.insert(NewEvent::new("stripe", json!({}))).await.unwrap();
        h.store.claim(running.id).await.unwrap();
        h.store
            .set_updated_at(running.id, Utc::now() - chrono::Duration::seconds(20))
            .await;
        let store = h.store.clone();
        let app = router(h.state);

        for secs in ["10", "30", "10000000000000"] {
            let uri = format!("/api/admin/webhook-events/reap?older_than_secs={secs}");
            let response = app
                .clone()
                .oneshot(admin_request("POST", &uri, None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{secs}");
            let body = json_body(response).await;
            assert!(body["message"]
                .as_str()
                .unwrap()
                .starts_with("invalid stale threshold"));
        }

        let running = store.find_by_id(running.id).await.unwrap().unwrap();
        assert_eq!(running.status, EventStatus::Processing);
        assert!(running.last_error.is_none());
    }
}
