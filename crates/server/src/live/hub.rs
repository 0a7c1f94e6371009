//! Realtime hub: connection registry with per-connection project
//! subscriptions.
//!
//! Each connection is an unbounded channel drained by the socket's forward
//! task. A send fails only when that task has ended, so a failed send means
//! the connection is gone and it is dropped from the registry.

use std::collections::HashSet;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::events::{DomainEvent, Envelope};

pub type ConnectionId = Uuid;

/// A connected realtime client.
pub struct Connection {
    pub tx: mpsc::UnboundedSender<String>,
    pub subscriptions: HashSet<String>,
    pub connected_at: Instant,
}

#[derive(Default)]
pub struct Hub {
    connections: DashMap<ConnectionId, Connection>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. The receiver yields serialized messages for it.
    pub fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Connection {
                tx,
                subscriptions: HashSet::new(),
                connected_at: Instant::now(),
            },
        );
        debug!(connection = %id, "Realtime client connected");
        (id, rx)
    }

    /// Drop a connection and all of its subscriptions.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&id) {
            debug!(
                connection = %id,
                connected_secs = conn.connected_at.elapsed().as_secs(),
                "Realtime client disconnected"
            );
        }
    }

    /// Add subscriptions. Returns false for an unknown connection.
    pub fn subscribe(&self, id: ConnectionId, project_ids: &[String]) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut conn) => {
                conn.subscriptions.extend(project_ids.iter().cloned());
                true
            }
            None => false,
        }
    }

    /// Remove subscriptions. Returns false for an unknown connection.
    pub fn unsubscribe(&self, id: ConnectionId, project_ids: &[String]) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut conn) => {
                for project_id in project_ids {
                    conn.subscriptions.remove(project_id);
                }
                true
            }
            None => false,
        }
    }

    /// Sorted subscriptions of a connection.
    pub fn subscriptions(&self, id: ConnectionId) -> Vec<String> {
        let mut subs: Vec<String> = self
            .connections
            .get(&id)
            .map(|c| c.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        subs.sort();
        subs
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Send a raw message to one connection. A failed send drops it.
    pub fn send(&self, id: ConnectionId, message: String) -> bool {
        let ok = self
            .connections
            .get(&id)
            .map(|c| c.tx.send(message).is_ok())
            .unwrap_or(false);
        if !ok {
            self.disconnect(id);
        }
        ok
    }

    /// Deliver an event to every connection subscribed to `project_id`.
    /// Returns the number of connections it reached.
    pub fn emit(&self, project_id: &str, event: &DomainEvent) -> usize {
        self.deliver(event, Some(project_id), |conn| {
            conn.subscriptions.contains(project_id)
        })
    }

    /// Deliver an event to all connections, tagged with `project` if given.
    pub fn broadcast(&self, event: &DomainEvent, project: Option<&str>) -> usize {
        self.deliver(event, project, |_| true)
    }

    fn deliver(
        &self,
        event: &DomainEvent,
        project: Option<&str>,
        wants: impl Fn(&Connection) -> bool,
    ) -> usize {
        let message = match serde_json::to_string(&Envelope::new(event, project)) {
            Ok(m) => m,
            Err(e) => {
                warn!(kind = event.kind(), error = %e, "Failed to serialize event");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for entry in self.connections.iter() {
            if !wants(entry.value()) {
                continue;
            }
            if entry.value().tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                failed.push(*entry.key());
            }
        }

        // Removal happens after iteration; DashMap shards are locked while iterating.
        for id in failed {
            self.disconnect(id);
        }
        delivered
    }
}
