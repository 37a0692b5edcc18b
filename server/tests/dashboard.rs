mod common;

use std::time::Duration;

use common::*;
use futures_util::{SinkExt, StreamExt};
use pagebot_server::config::AppConfig;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};

fn dashboard_url(addr: &str, operator: &str) -> String {
    format!("ws://{addr}/ws?tenantId={TENANT}&operatorId={operator}&operatorName=Ana")
}

#[tokio::test]
async fn closing_the_socket_unregisters_the_connection() {
    let h = harness(FakeModel::replying("hi"));
    let addr = serve(&h).await;

    let (mut socket, _) = connect_async(dashboard_url(&addr, "A"))
        .await
        .expect("connect");
    assert!(eventually(|| h.state.hub.connection_count(TENANT) == 1).await);

    socket.close(None).await.expect("close");
    assert!(eventually(|| h.state.hub.connection_count(TENANT) == 0).await);
}

#[tokio::test]
async fn silent_client_is_dropped_after_read_deadline() {
    let config = AppConfig {
        ws_read_timeout: Duration::from_millis(200),
        ws_ping_interval: Duration::from_secs(30),
        ..AppConfig::default()
    };
    let h = harness_with_config(FakeModel::replying("hi"), config);
    let addr = serve(&h).await;

    let (_socket, _) = connect_async(dashboard_url(&addr, "A"))
        .await
        .expect("connect");
    assert!(eventually(|| h.state.hub.connection_count(TENANT) == 1).await);
    assert!(eventually(|| h.state.hub.connection_count(TENANT) == 0).await);
}

#[tokio::test]
async fn assign_command_answers_with_result_and_broadcast() {
    let h = harness(FakeModel::replying("hi"));
    let addr = serve(&h).await;

    let (mut socket, _) = connect_async(dashboard_url(&addr, "A"))
        .await
        .expect("connect");
    assert!(eventually(|| h.state.hub.connection_count(TENANT) == 1).await);

    let command = json!({
        "event": "operator:assign",
        "data": { "requestId": "r1", "pageId": PAGE, "participantId": "U1" }
    });
    socket
        .send(Message::text(command.to_string()))
        .await
        .expect("send");

    let mut events = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(frame) = socket.next().await {
            let frame = frame.expect("frame");
            let Ok(text) = frame.to_text() else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(text) else {
                continue;
            };
            events.push(value["event"].as_str().unwrap_or("").to_string());
            if value["event"] == "command_result" {
                return value;
            }
        }
        Value::Null
    })
    .await
    .expect("command result");

    assert_eq!(events, vec!["agent_assignment_changed", "command_result"]);
    assert_eq!(result["data"]["requestId"], "r1");
    assert_eq!(result["data"]["ok"], true);
    assert_eq!(result["data"]["data"]["state"]["assignedOperatorId"], "A");
}

#[tokio::test]
async fn connection_without_operator_is_refused() {
    let h = harness(FakeModel::replying("hi"));
    let addr = serve(&h).await;

    let refused = connect_async(format!("ws://{addr}/ws?tenantId={TENANT}")).await;
    assert!(refused.is_err());
    assert_eq!(h.state.hub.connection_count(TENANT), 0);
}
