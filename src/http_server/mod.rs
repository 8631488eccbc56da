//! HTTP surface: cron trigger, inbound receiver and admin tooling.
//!
//! # Routes
//!
//! ## Public
//! - `GET /health`
//! - `POST /api/webhooks/{source}` - record an inbound webhook (HMAC when configured)
//!
//! ## Cron (`Authorization: Bearer <CRON_SECRET>`)
//! - `GET|POST /api/cron/process-webhooks?batch_size=N`
//!
//! ## Admin (`Authorization: Bearer <admin token>`)
//! - `GET /api/admin/webhook-events?status=&limit=`
//! - `GET /api/admin/webhook-events/stats`
//! - `GET /api/admin/webhook-events/{id}`
//! - `POST /api/admin/webhook-events/{id}/replay`
//! - `POST /api/admin/webhook-events/reap?older_than_secs=N`
//! - `GET|POST /api/admin/kill-switch`

mod admin;
mod auth;
mod cron;
mod ingest;

use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::config::Config;
use crate::processor::Processor;
use crate::reaper::Reaper;
use crate::replay::ReplayController;
use crate::store::EventStore;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn EventStore>,
    pub processor: Arc<Processor>,
    pub replay: Arc<ReplayController>,
    pub reaper: Arc<Reaper>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn EventStore>, processor: Processor) -> Self {
        let reaper = Reaper::new(store.clone(), config.attempt_timeout);
        Self {
            config: Arc::new(config),
            replay: Arc::new(ReplayController::new(store.clone())),
            reaper: Arc::new(reaper),
            processor: Arc::new(processor),
            store,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/webhook-events", get(admin::list_events))
        .route("/webhook-events/stats", get(admin::stats))
        .route("/webhook-events/reap", post(admin::reap))
        .route("/webhook-events/{id}", get(admin::get_event))
        .route("/webhook-events/{id}/replay", post(admin::replay_event))
        .route(
            "/kill-switch",
            get(admin::get_kill_switch).post(admin::set_kill_switch),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_admin,
        ));

    Router::new()
        .route("/health", get(health))
        .route(
            "/api/cron/process-webhooks",
            get(cron::process_webhooks).post(cron::process_webhooks),
        )
        .route("/api/webhooks/{source}", post(ingest::receive))
        .nest("/api/admin", admin)
        .with_state(state)
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, Response};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::kill_switch::KillSwitch;
    use crate::processor::tests::ScriptedHandler;
    use crate::store::MemoryEventStore;

    pub const CRON_SECRET: &str = "cron-secret";
    pub const ADMIN_TOKEN: &str = "admin-token";

    pub struct Harness {
        pub state: AppState,
        pub store: Arc<MemoryEventStore>,
        pub handler: Arc<ScriptedHandler>,
    }

    pub fn harness(extra: &[(&str, &str)]) -> Harness {
        let mut vars = HashMap::new();
        vars.insert("CRON_SECRET".to_string(), CRON_SECRET.to_string());
        vars.insert("ADMIN_API_TOKENS".to_string(), ADMIN_TOKEN.to_string());
        for (k, v) in extra {
            vars.insert(k.to_string(), v.to_string());
        }
        let config = Config::from_vars(&vars).unwrap();

        let store = Arc::new(MemoryEventStore::new());
        let handler = Arc::new(ScriptedHandler::default());
        let processor = Processor::new(
            store.clone(),
            handler.clone(),
            KillSwitch::new(config.processing_enabled),
            Duration::from_secs(1),
            config.max_batch_size,
        );
        let state = AppState::new(config, store.clone(), processor);
        Harness {
            state,
            store,
            handler,
        }
    }

    pub async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub fn admin_request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {ADMIN_TOKEN}"));
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }
}
