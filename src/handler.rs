use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::error::PipelineError;
use crate::signature;
use crate::types::WebhookEvent;

/// Failure of a single downstream attempt. Recorded on the event as
/// `last_error`; never aborts a batch.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("downstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("downstream returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

/// The side effect performed for each claimed event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError>;

    /// Checked once per batch before any event is claimed.
    fn check_ready(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Re-delivers event payloads to a downstream HTTP consumer.
pub struct HttpForwarder {
    client: reqwest::Client,
    url: Option<String>,
    secret: Option<String>,
}

/// Longest downstream body kept in `last_error`.
const MAX_ERROR_BODY: usize = 512;

impl HttpForwarder {
    pub fn new(url: Option<String>, secret: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.map(|u| u.trim_end_matches('/').to_string()),
            secret,
        }
    }
}

#[async_trait]
impl EventHandler for HttpForwarder {
    async fn handle(&self, event: &WebhookEvent) -> Result<(), HandlerError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| HandlerError::Other("no forward url configured".into()))?;
        let body = serde_json::to_vec(&event.payload)
            .map_err(|e| HandlerError::Other(format!("payload serialization failed: {e}")))?;

        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("x-webhook-id", event.id.to_string())
            .header("x-webhook-source", &event.source)
            .header("x-webhook-attempt", event.attempts.to_string());
        if let Some(event_type) = &event.event_type {
            request = request.header("x-webhook-event-type", event_type);
        }
        if let Some(secret) = &self.secret {
            let sig = signature::sign_body(secret.as_bytes(), &body)
                .map_err(|e| HandlerError::Other(format!("signing failed: {e}")))?;
            request = request.header("x-webhook-signature", sig);
        }

        let resp = request.body(body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(HandlerError::Rejected { status, body: text });
        }
        Ok(())
    }

    fn check_ready(&self) -> Result<(), PipelineError> {
        match self.url {
            Some(_) => Ok(()),
            None => Err(PipelineError::Configuration(
                "WEBHOOK_FORWARD_URL is not set".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    use crate::types::EventStatus;

    fn event() -> WebhookEvent {
        WebhookEvent {
            id: Uuid::new_v4(),
            source: "stripe".into(),
            event_type: Some("checkout.session.completed".into()),
            status: EventStatus::Processing,
            payload: serde_json::json!({ "amount": 500 }),
            attempts: 1,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    type Seen = Arc<Mutex<Vec<(HeaderMap, Bytes)>>>;

    async fn downstream(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let recorder = seen.clone();
        let app = Router::new().route(
            "/sink",
            post(move |headers: HeaderMap, body: Bytes| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push((headers, body));
                    (status, "sink says no")
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://127.0.0.1:{port}/sink"), seen)
    }

    #[tokio::test]
    async fn forwards_signed_payload() {
        let (url, seen) = downstream(StatusCode::OK).await;
        let forwarder = HttpForwarder::new(Some(url), Some("fwd-secret".into()));
        let ev = event();

        forwarder.handle(&ev).await.unwrap();

        let seen = seen.lock().unwrap();
        let (headers, body) = &seen[0];
        assert_eq!(headers["x-webhook-id"], ev.id.to_string().as_str());
        assert_eq!(headers["x-webhook-source"], "stripe");
        assert_eq!(headers["x-webhook-attempt"], "1");
        let sig = headers["x-webhook-signature"].to_str().unwrap();
        assert!(signature::verify_hex_signature(b"fwd-secret", body, sig));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (url, _seen) = downstream(StatusCode::BAD_GATEWAY).await;
        let forwarder = HttpForwarder::new(Some(url), None);

        let err = forwarder.handle(&event()).await.unwrap_err();
        match err {
            HandlerError::Rejected { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body, "sink says no");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_url_is_a_configuration_error() {
        let forwarder = HttpForwarder::new(None, None);
        assert!(matches!(
            forwarder.check_ready(),
            Err(PipelineError::Configuration(_))
        ));
    }
}
