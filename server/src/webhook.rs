//! Graph webhook ingress: subscription handshake and event decoding.
//! Signature verification happens in front of this service.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::app::AppState;
use crate::types::{iso, now_iso, Channel, InboundEvent};

pub async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    let expected_verify_token = state.config.webhook_verify_token.trim();

    if mode == "subscribe"
        && !challenge.is_empty()
        && !expected_verify_token.is_empty()
        && verify_token == expected_verify_token
    {
        return (StatusCode::OK, challenge).into_response();
    }

    warn!(mode = %mode, "webhook verification rejected");
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

pub async fn webhook_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let object = payload.get("object").and_then(Value::as_str).unwrap_or("");
    if !object.is_empty() && object != "page" {
        debug!(object, "ignoring non-page webhook");
        return (
            StatusCode::OK,
            Json(json!({ "received": true, "processed": 0 })),
        )
            .into_response();
    }

    let events = decode_webhook(&payload);
    let processed = events.len();
    for event in events {
        state.router.spawn(event);
    }

    (
        StatusCode::OK,
        Json(json!({ "received": true, "processed": processed })),
    )
        .into_response()
}

/// Extracts chat messages and new comments. Attachments without text,
/// reactions and edits are skipped.
pub fn decode_webhook(payload: &Value) -> Vec<InboundEvent> {
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut events = Vec::new();
    for entry in entries {
        let page_id = entry.get("id").and_then(Value::as_str).unwrap_or("");

        let messaging = entry
            .get("messaging")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for item in messaging {
            if let Some(event) = decode_message(page_id, &item) {
                events.push(event);
            }
        }

        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for change in changes {
            if change.get("field").and_then(Value::as_str) != Some("feed") {
                continue;
            }
            let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
            if let Some(event) = decode_comment(page_id, &value) {
                events.push(event);
            }
        }
    }
    events
}

fn decode_message(entry_page_id: &str, item: &Value) -> Option<InboundEvent> {
    let message = item.get("message")?;
    let event_id = text_field(message, "mid")?;
    let text = text_field(message, "text")?;
    let sender = item
        .get("sender")
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if sender.is_empty() {
        return None;
    }
    let recipient = item
        .get("recipient")
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let is_echo = message
        .get("is_echo")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    // Echoes are addressed to the participant; keep the page as the key so the
    // router recognises its own message.
    let page_id = if is_echo || recipient.is_empty() {
        entry_page_id
    } else {
        recipient
    };
    let timestamp = item
        .get("timestamp")
        .and_then(Value::as_i64)
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(iso)
        .unwrap_or_else(now_iso);

    Some(InboundEvent {
        event_id,
        channel: Channel::Message,
        participant_id: sender,
        participant_name: String::new(),
        page_id: page_id.to_string(),
        text,
        parent_id: None,
        post_id: None,
        timestamp,
    })
}

fn decode_comment(entry_page_id: &str, value: &Value) -> Option<InboundEvent> {
    if value.get("item").and_then(Value::as_str) != Some("comment") {
        return None;
    }
    let verb = value.get("verb").and_then(Value::as_str).unwrap_or("add");
    if verb != "add" {
        return None;
    }
    let event_id = text_field(value, "comment_id")?;
    let text = text_field(value, "message")?;
    let from = value.get("from")?;
    let participant_id = text_field(from, "id")?;
    let participant_name = from
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let timestamp = value
        .get("created_time")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(iso)
        .unwrap_or_else(now_iso);

    Some(InboundEvent {
        event_id,
        channel: Channel::Comment,
        participant_id,
        participant_name,
        page_id: entry_page_id.to_string(),
        text,
        parent_id: text_field(value, "parent_id"),
        post_id: text_field(value, "post_id"),
        timestamp,
    })
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
