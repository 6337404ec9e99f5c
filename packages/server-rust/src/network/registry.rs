//! Id to connection lookup.
//!
//! The registry stores `Weak` handles: it never keeps a connection alive.
//! Entries are pruned when a connection closes or its last handle drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use msgque_core::Message;

use super::connection::{ConnectionHandle, ConnectionId};

/// Thread-safe registry of open connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Weak<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Connection ids start at 1 (0 is reserved as "no connection").
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert(&self, handle: &Arc<ConnectionHandle>) {
        self.connections.insert(handle.id(), Arc::downgrade(handle));
        metrics::gauge!("msgque_connections").increment(1.0);
    }

    /// Drops the entry for `id`. Returns `false` if it was already gone.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            metrics::gauge!("msgque_connections").decrement(1.0);
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).and_then(|entry| entry.value().upgrade())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Live connections, collected so callers never hold a map guard while
    /// touching a handle.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Sends `msg` to every connection without blocking; full channels are
    /// skipped. Returns how many connections accepted it.
    pub fn broadcast(&self, msg: &Message) -> usize {
        self.connections()
            .iter()
            .filter(|conn| conn.try_send(msg.clone()))
            .count()
    }

    /// Like [`broadcast`](Self::broadcast), restricted to members of `group`.
    pub fn broadcast_group(&self, group: &str, msg: &Message) -> usize {
        self.connections()
            .iter()
            .filter(|conn| conn.is_in_group(group) && conn.try_send(msg.clone()))
            .count()
    }

    /// Removes and returns every live connection.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, weak)) = self.connections.remove(&key) {
                metrics::gauge!("msgque_connections").decrement(1.0);
                if let Some(handle) = weak.upgrade() {
                    handles.push(handle);
                }
            }
        }
        handles
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
