//! Fan-out of pipeline state changes to connected operator dashboards.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeEvent {
    NewMessage,
    AgentAssignmentChanged,
    AgentRequested,
    CustomerStopStatusChanged,
    CommandResult,
}

impl RealtimeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::AgentAssignmentChanged => "agent_assignment_changed",
            Self::AgentRequested => "agent_requested",
            Self::CustomerStopStatusChanged => "customer_stop_status_changed",
            Self::CommandResult => "command_result",
        }
    }
}

pub fn event_payload<T: Serialize>(event: RealtimeEvent, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event.as_str(), "data": data })).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: u64,
    pub tenant_id: String,
    pub operator_id: String,
}

type OperatorConnections = HashMap<String, HashMap<u64, mpsc::Sender<String>>>;

pub struct BroadcastHub {
    tenants: DashMap<String, OperatorConnections>,
    next_connection_id: AtomicU64,
    queue_capacity: usize,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            tenants: DashMap::new(),
            next_connection_id: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn register(
        &self,
        tenant_id: &str,
        operator_id: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel::<String>(self.queue_capacity);
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .entry(operator_id.to_string())
            .or_default()
            .insert(id, tx);
        debug!(tenant = %tenant_id, operator = %operator_id, connection = id, "dashboard registered");
        (
            ConnectionHandle {
                id,
                tenant_id: tenant_id.to_string(),
                operator_id: operator_id.to_string(),
            },
            rx,
        )
    }

    pub fn unregister(&self, handle: &ConnectionHandle) {
        self.remove_connections(&handle.tenant_id, &[(handle.operator_id.clone(), handle.id)]);
        debug!(
            tenant = %handle.tenant_id,
            operator = %handle.operator_id,
            connection = handle.id,
            "dashboard unregistered"
        );
    }

    /// Enqueues on every connection of the tenant without waiting. Returns how
    /// many connections accepted the frame.
    pub fn broadcast<T: Serialize>(&self, tenant_id: &str, event: RealtimeEvent, data: T) -> usize {
        let Some(payload) = event_payload(event, data) else {
            return 0;
        };
        let mut delivered = 0usize;
        let mut closed = Vec::new();
        if let Some(operators) = self.tenants.get(tenant_id) {
            for (operator_id, connections) in operators.iter() {
                for (connection_id, sender) in connections {
                    match sender.try_send(payload.clone()) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => {
                            warn!(
                                tenant = %tenant_id,
                                operator = %operator_id,
                                connection = connection_id,
                                event = event.as_str(),
                                "dashboard queue full, dropping frame"
                            );
                        }
                        Err(TrySendError::Closed(_)) => {
                            closed.push((operator_id.clone(), *connection_id));
                        }
                    }
                }
            }
        }
        if !closed.is_empty() {
            self.remove_connections(tenant_id, &closed);
        }
        delivered
    }

    /// Enqueues on every connection of one operator within the tenant.
    pub fn send_to_operator<T: Serialize>(
        &self,
        tenant_id: &str,
        operator_id: &str,
        event: RealtimeEvent,
        data: T,
    ) -> usize {
        let Some(payload) = event_payload(event, data) else {
            return 0;
        };
        let mut delivered = 0usize;
        let mut closed = Vec::new();
        if let Some(operators) = self.tenants.get(tenant_id) {
            if let Some(connections) = operators.get(operator_id) {
                for (connection_id, sender) in connections {
                    match sender.try_send(payload.clone()) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Closed(_)) => {
                            closed.push((operator_id.to_string(), *connection_id))
                        }
                    }
                }
            }
        }
        if !closed.is_empty() {
            self.remove_connections(tenant_id, &closed);
        }
        delivered
    }

    pub fn connection_count(&self, tenant_id: &str) -> usize {
        self.tenants
            .get(tenant_id)
            .map(|operators| operators.values().map(HashMap::len).sum())
            .unwrap_or(0)
    }

    fn remove_connections(&self, tenant_id: &str, targets: &[(String, u64)]) {
        if let Some(mut operators) = self.tenants.get_mut(tenant_id) {
            for (operator_id, connection_id) in targets {
                if let Some(connections) = operators.get_mut(operator_id) {
                    connections.remove(connection_id);
                    if connections.is_empty() {
                        operators.remove(operator_id);
                    }
                }
            }
        }
        self.tenants
            .remove_if(tenant_id, |_, operators| operators.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn broadcast_reaches_only_the_tenant() {
        let hub = BroadcastHub::new(8);
        let (_a, mut rx_a) = hub.register("t1", "op-a");
        let (_b, mut rx_b) = hub.register("t1", "op-b");
        let (_c, mut rx_c) = hub.register("t2", "op-c");

        let delivered = hub.broadcast("t1", RealtimeEvent::AgentRequested, json!({ "x": 1 }));
        assert_eq!(delivered, 2);

        let frame: Value = serde_json::from_str(&rx_a.recv().await.expect("frame")).expect("json");
        assert_eq!(frame["event"], "agent_requested");
        assert_eq!(frame["data"]["x"], 1);
        assert!(rx_b.recv().await.is_some());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_frame_without_blocking() {
        let hub = BroadcastHub::new(1);
        let (handle, mut rx) = hub.register("t1", "op-a");
        assert_eq!(hub.broadcast("t1", RealtimeEvent::NewMessage, json!({ "n": 1 })), 1);
        assert_eq!(hub.broadcast("t1", RealtimeEvent::NewMessage, json!({ "n": 2 })), 0);
        assert_eq!(hub.connection_count("t1"), 1);

        let frame: Value = serde_json::from_str(&rx.recv().await.expect("frame")).expect("json");
        assert_eq!(frame["data"]["n"], 1);
        hub.unregister(&handle);
        assert_eq!(hub.connection_count("t1"), 0);
    }

    #[tokio::test]
    async fn closed_connection_is_pruned_on_broadcast() {
        let hub = BroadcastHub::new(4);
        let (_gone, rx_gone) = hub.register("t1", "op-a");
        let (_live, mut rx_live) = hub.register("t1", "op-b");
        drop(rx_gone);

        assert_eq!(hub.broadcast("t1", RealtimeEvent::NewMessage, json!({})), 1);
        assert_eq!(hub.connection_count("t1"), 1);
        assert!(rx_live.recv().await.is_some());
    }

    #[tokio::test]
    async fn targeted_send_skips_other_operators() {
        let hub = BroadcastHub::new(4);
        let (_a1, mut rx_a1) = hub.register("t1", "op-a");
        let (_a2, mut rx_a2) = hub.register("t1", "op-a");
        let (_b, mut rx_b) = hub.register("t1", "op-b");

        let delivered =
            hub.send_to_operator("t1", "op-a", RealtimeEvent::CommandResult, json!({ "ok": true }));
        assert_eq!(delivered, 2);
        assert!(rx_a1.recv().await.is_some());
        assert!(rx_a2.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }
}
