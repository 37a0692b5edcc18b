//! Operator dashboard socket: one send loop with keep-alive pings and one
//! receive loop with a read deadline. Either side ending tears both down.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::app::AppState;
use crate::error::AssignmentError;
use crate::realtime::RealtimeEvent;
use crate::types::{DashboardConnectQuery, EventEnvelopeIn, OperatorIdentity, ParticipantKey};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<DashboardConnectQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if query.tenant_id.trim().is_empty() || query.operator_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "tenantId and operatorId are required" })),
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, query: DashboardConnectQuery) {
    let tenant_id = query.tenant_id.trim().to_string();
    let operator = OperatorIdentity::new(query.operator_id.trim(), query.operator_name.trim());
    let (handle, mut rx) = state.hub.register(&tenant_id, &operator.id);
    info!(tenant = %tenant_id, operator = %operator.id, connection = handle.id, "dashboard connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let ping_every = state.config.ws_ping_interval;
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_every);
        ticker.tick().await;
        loop {
            tokio::select! {
                next = rx.recv() => {
                    let Some(payload) = next else {
                        break;
                    };
                    if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if ws_sender.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let read_timeout = state.config.ws_read_timeout;
    let recv_state = state.clone();
    let recv_tenant = tenant_id.clone();
    let recv_operator = operator.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let message = match tokio::time::timeout(read_timeout, ws_receiver.next()).await {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => {
                    debug!(tenant = %recv_tenant, operator = %recv_operator.id, "read deadline passed");
                    break;
                }
            };
            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
                continue;
            };
            handle_command(&recv_state, &recv_tenant, &recv_operator, envelope).await;
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unregister(&handle);
    info!(tenant = %tenant_id, operator = %operator.id, connection = handle.id, "dashboard disconnected");
}

async fn handle_command(
    state: &Arc<AppState>,
    tenant_id: &str,
    operator: &OperatorIdentity,
    envelope: EventEnvelopeIn,
) {
    let command = envelope.event.clone();
    let request_id = envelope.data.get("requestId").cloned().unwrap_or(Value::Null);
    let result = run_command(state, tenant_id, operator, &envelope).await;
    let payload = match result {
        Ok(data) => json!({
            "command": command,
            "requestId": request_id,
            "ok": true,
            "data": data,
        }),
        Err(err) => {
            debug!(tenant = %tenant_id, operator = %operator.id, command = %command, error = %err, "command rejected");
            json!({
                "command": command,
                "requestId": request_id,
                "ok": false,
                "error": err.to_string(),
                "code": err.code(),
            })
        }
    };
    state
        .hub
        .send_to_operator(tenant_id, &operator.id, RealtimeEvent::CommandResult, payload);
}

async fn run_command(
    state: &Arc<AppState>,
    tenant_id: &str,
    operator: &OperatorIdentity,
    envelope: &EventEnvelopeIn,
) -> Result<Value, AssignmentError> {
    let data = &envelope.data;
    let page_id = data_text(data, "pageId");
    let participant_id = data_text(data, "participantId");
    if page_id.is_empty() || participant_id.is_empty() {
        return Err(AssignmentError::InvalidRequest(
            "pageId and participantId are required".to_string(),
        ));
    }
    let page = state
        .assignments
        .resolve_page(&page_id, Some(tenant_id))
        .await?;
    let key = ParticipantKey::new(&participant_id, &page_id);
    let manager = &state.assignments;

    let transition = match envelope.event.as_str() {
        "operator:send" => {
            let record = manager
                .send_as_operator(&page, &key, &data_text(data, "text"), operator)
                .await?;
            return Ok(json!(record));
        }
        "operator:assign" => manager.assign(&page, &key, operator).await?,
        "operator:unassign" => manager.unassign(&page, &key, operator).await?,
        "operator:resolve" => manager.resolve(&page, &key, operator).await?,
        "operator:stop" => {
            let stopped = data.get("stopped").and_then(Value::as_bool).unwrap_or(true);
            manager.set_stop_status(&page, &key, stopped, operator).await?
        }
        other => {
            return Err(AssignmentError::InvalidRequest(format!(
                "unknown command {other}"
            )))
        }
    };
    Ok(json!({ "state": transition.state, "changed": transition.changed }))
}

fn data_text(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}
