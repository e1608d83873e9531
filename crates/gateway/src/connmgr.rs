//! Connection bookkeeping and event fan-out.
//!
//! Each connection's outbound frames go through an unbounded channel
//! drained by a single writer task, which serializes writes per
//! connection. Broadcasts stamp a gateway-wide sequence number.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{event_frame, Frame, ROLE_BRIDGE, ROLE_CLIENT};

/// A single admitted WebSocket connection.
pub struct Conn {
    pub id: String,
    pub role: String,
    /// Bridge only: the channel this bridge adapts.
    pub channel: String,
    pub capabilities: Vec<String>,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Conn {
    pub fn new(
        id: &str,
        role: &str,
        channel: &str,
        capabilities: Vec<String>,
        tx: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            channel: channel.to_string(),
            capabilities,
            connected_at: Utc::now(),
            tx,
        }
    }

    /// Enqueue a frame for this connection's writer task.
    pub fn send(&self, frame: Frame) -> bool {
        let ok = self.tx.send(frame).is_ok();
        if !ok {
            debug!(conn = %self.id, "send to closed connection");
        }
        ok
    }
}

/// Tracks all active connections.
#[derive(Default)]
pub struct ConnManager {
    conns: RwLock<HashMap<String, Arc<Conn>>>,
    seq: AtomicU64,
}

impl ConnManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Conn>) {
        self.conns.write().unwrap().insert(conn.id.clone(), conn);
    }

    pub fn remove(&self, conn_id: &str) {
        self.conns.write().unwrap().remove(conn_id);
    }

    pub fn get(&self, conn_id: &str) -> Option<Arc<Conn>> {
        self.conns.read().unwrap().get(conn_id).cloned()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Send an event to every connection.
    pub fn broadcast(&self, event: &str, payload: serde_json::Value) {
        let frame = event_frame(event, self.next_seq(), payload);
        for conn in self.conns.read().unwrap().values() {
            conn.send(frame.clone());
        }
    }

    /// Send an event to every connection with the given role.
    pub fn broadcast_to_role(&self, role: &str, event: &str, payload: serde_json::Value) {
        let frame = event_frame(event, self.next_seq(), payload);
        for conn in self.conns.read().unwrap().values() {
            if conn.role == role {
                conn.send(frame.clone());
            }
        }
    }

    /// Send an event to the bridges of one channel.
    pub fn broadcast_to_channel(&self, channel: &str, event: &str, payload: serde_json::Value) {
        let frame = event_frame(event, self.next_seq(), payload);
        for conn in self.conns.read().unwrap().values() {
            if conn.role == ROLE_BRIDGE && conn.channel == channel {
                conn.send(frame.clone());
            }
        }
    }

    /// Connected bridge descriptors, for health output.
    pub fn list_bridges(&self) -> Vec<serde_json::Value> {
        let conns = self.conns.read().unwrap();
        let mut bridges: Vec<&Arc<Conn>> = conns
            .values()
            .filter(|c| c.role == ROLE_BRIDGE)
            .collect();
        bridges.sort_by(|a, b| a.id.cmp(&b.id));
        bridges
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "channel": c.channel,
                    "capabilities": c.capabilities,
                    "connectedAt": c.connected_at,
                })
            })
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.conns
            .read()
            .unwrap()
            .values()
            .filter(|c| c.role == ROLE_CLIENT)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(id: &str, role: &str, channel: &str) -> (Arc<Conn>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Conn::new(id, role, channel, Vec::new(), tx)),
            rx,
        )
    }

    #[test]
    fn broadcast_to_role_filters() {
        let mgr = ConnManager::new();
        let (client, mut client_rx) = test_conn("c1", ROLE_CLIENT, "");
        let (bridge, mut bridge_rx) = test_conn("b1", ROLE_BRIDGE, "tg");
        mgr.add(client);
        mgr.add(bridge);

        mgr.broadcast_to_role(ROLE_CLIENT, "agent", serde_json::json!({"n": 1}));

        let frame = client_rx.try_recv().unwrap();
        assert_eq!(frame.event, "agent");
        assert!(bridge_rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_to_channel_targets_bridges() {
        let mgr = ConnManager::new();
        let (tg, mut tg_rx) = test_conn("b1", ROLE_BRIDGE, "tg");
        let (feishu, mut feishu_rx) = test_conn("b2", ROLE_BRIDGE, "feishu");
        let (client, mut client_rx) = test_conn("c1", ROLE_CLIENT, "");
        mgr.add(tg);
        mgr.add(feishu);
        mgr.add(client);

        mgr.broadcast_to_channel("tg", "outbound.message", serde_json::json!({}));

        assert!(tg_rx.try_recv().is_ok());
        assert!(feishu_rx.try_recv().is_err());
        assert!(client_rx.try_recv().is_err());
    }

    #[test]
    fn seq_increases_across_broadcasts() {
        let mgr = ConnManager::new();
        let (conn, mut rx) = test_conn("c1", ROLE_CLIENT, "");
        mgr.add(conn);

        mgr.broadcast("a", serde_json::json!({}));
        mgr.broadcast("b", serde_json::json!({}));

        let first = rx.try_recv().unwrap().seq;
        let second = rx.try_recv().unwrap().seq;
        assert!(second > first);
    }

    #[test]
    fn remove_stops_delivery() {
        let mgr = ConnManager::new();
        let (conn, mut rx) = test_conn("c1", ROLE_CLIENT, "");
        mgr.add(conn);
        mgr.remove("c1");
        mgr.broadcast("x", serde_json::json!({}));
        assert!(rx.try_recv().is_err());
        assert_eq!(mgr.client_count(), 0);
    }

    #[test]
    fn bridge_listing() {
        let mgr = ConnManager::new();
        let (bridge, _rx) = test_conn("b1", ROLE_BRIDGE, "tg");
        mgr.add(bridge);
        let listed = mgr.list_bridges();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["channel"], "tg");
    }
}
