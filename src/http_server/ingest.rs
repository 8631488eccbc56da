//! Inbound webhook receiver. Stores the delivery as a pending event and
//! returns before any downstream work happens.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::AppState;
use crate::error::ApiError;
use crate::signature;
use crate::types::NewEvent;

const MAX_SOURCE_LEN: usize = 64;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn valid_source(source: &str) -> bool {
    !source.is_empty()
        && source.len() <= MAX_SOURCE_LEN
        && source
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

/// Accepts either a `x-hub-signature-256` HMAC header or a Standard Webhooks
/// signature set.
fn verified(secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    if let Some(sig) = header(headers, "x-hub-signature-256") {
        return signature::verify_hex_signature(secret.as_bytes(), body, sig);
    }
    match (
        header(headers, "webhook-id"),
        header(headers, "webhook-timestamp"),
        header(headers, "webhook-signature"),
    ) {
        (Some(id), Some(ts), Some(sig)) => {
            signature::verify_standard_webhooks(secret, body, id, ts, sig)
        }
        _ => false,
    }
}

fn event_type(headers: &HeaderMap, payload: &Value) -> Option<String> {
    header(headers, "x-webhook-event-type")
        .map(str::to_string)
        .or_else(|| payload.get("type").and_then(Value::as_str).map(str::to_string))
}

pub async fn receive(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !valid_source(&source) {
        return Err(ApiError::BadRequest(format!("invalid source: {source}")));
    }

    if let Some(secret) = state.config.source_secret(&source) {
        if !verified(secret, &headers, &body) {
            warn!(source = %source, "webhook signature verification failed");
            return Err(ApiError::Unauthorized);
        }
    }

    // Non-JSON bodies are kept verbatim as a string.
    let payload: Value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into()));

    let mut new = NewEvent::new(source.clone(), payload);
    new.event_type = event_type(&headers, &new.payload);

    let event = state.store.insert(new).await?;
    info!(
        event_id = %event.id,
        source = %source,
        event_type = event.event_type.as_deref().unwrap_or(""),
        "webhook received"
    );

    Ok((StatusCode::ACCEPTED, Json(json!({ "id": event.id }))))
}
