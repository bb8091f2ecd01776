//! Connect/disconnect bookkeeping and administrative parent maintenance.

use std::collections::VecDeque;

use tracing::{debug, warn};

use cstoken_core::records::{ConnectedClient, DisconnectedClient, Node, Reparented};
use cstoken_core::store::Store;
use cstoken_core::types::{NodeAddress, Timestamp};

use crate::registry::{self, RegistryError};

/// Mark `source_ip` connected. Repeating the call reports the stored connection.
pub fn connect(
    store: &mut dyn Store,
    source_ip: &NodeAddress,
    process_id: &str,
    now: Timestamp,
) -> Result<ConnectedClient, RegistryError> {
    let node = registry::set_connected(store, source_ip, process_id, now)?;
    Ok(ConnectedClient {
        source_ip: node.address,
        connected_at: node.connected_at.unwrap_or(now),
        process_id: process_id.to_string(),
    })
}

/// Mark `source_ip` disconnected. Repeating the call reports the stored disconnection.
pub fn disconnect(store: &mut dyn Store, source_ip: &NodeAddress, now: Timestamp) -> Result<DisconnectedClient, RegistryError> {
    let node = registry::set_disconnected(store, source_ip, now)?;
    Ok(DisconnectedClient {
        source_ip: node.address,
        disconnected_at: node.disconnected_at.unwrap_or(now),
    })
}

pub fn reparent(store: &mut dyn Store, source_ip: &NodeAddress, parent_ip: &NodeAddress) -> Result<Node, RegistryError> {
    registry::set_parent(store, source_ip, parent_ip)
}

/// Apply a replicated connection event from another runtime. Returns `None` when
/// the node already moved on to a newer connection state.
pub fn apply_connected(store: &mut dyn Store, event: &ConnectedClient) -> Result<Option<Node>, RegistryError> {
    if is_stale(store, &event.source_ip, event.connected_at)? {
        return Ok(None);
    }
    registry::set_connected(store, &event.source_ip, &event.process_id, event.connected_at).map(Some)
}

pub fn apply_disconnected(store: &mut dyn Store, event: &DisconnectedClient) -> Result<Option<Node>, RegistryError> {
    if is_stale(store, &event.source_ip, event.disconnected_at)? {
        return Ok(None);
    }
    registry::set_disconnected(store, &event.source_ip, event.disconnected_at).map(Some)
}

pub fn apply_reparented(store: &mut dyn Store, event: &Reparented) -> Result<Node, RegistryError> {
    registry::set_parent(store, &event.source_ip, &event.parent_ip)
}

/// Connectivity events carry their own timestamps; the newest transition wins.
fn is_stale(store: &dyn Store, address: &NodeAddress, at: Timestamp) -> Result<bool, RegistryError> {
    let node = registry::lookup(store, address)?;
    let latest = node.connected_at.max(node.disconnected_at);
    let stale = latest.is_some_and(|latest| at < latest);
    if stale {
        debug!(node = %address, at = %at, "Ignoring out-of-date connectivity event");
    }
    Ok(stale)
}

/// A registry change replicated from another runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatedUpdate {
    Connected(ConnectedClient),
    Disconnected(DisconnectedClient),
    Reparented(Reparented),
}

impl ReplicatedUpdate {
    fn apply(&self, store: &mut dyn Store) -> Result<(), RegistryError> {
        match self {
            ReplicatedUpdate::Connected(event) => apply_connected(store, event).map(drop),
            ReplicatedUpdate::Disconnected(event) => apply_disconnected(store, event).map(drop),
            ReplicatedUpdate::Reparented(event) => apply_reparented(store, event).map(drop),
        }
    }
}

/// Updates that reached this runtime before the registration they refer to. They
/// are replayed, in arrival order, whenever a new node is registered.
#[derive(Debug)]
pub struct DeferredUpdates {
    pending: VecDeque<ReplicatedUpdate>,
    capacity: usize,
}

impl DeferredUpdates {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity,
        }
    }

    /// Apply `update`, parking it if it names a node this store does not know yet.
    /// Returns whether it was parked.
    pub fn apply_or_defer(&mut self, store: &mut dyn Store, update: ReplicatedUpdate) -> Result<bool, RegistryError> {
        match update.apply(store) {
            Ok(()) => Ok(false),
            Err(RegistryError::UnknownNode(address)) => {
                debug!(node = %address, "Deferring update until the node is registered");
                if self.pending.len() >= self.capacity {
                    if let Some(dropped) = self.pending.pop_front() {
                        warn!(update = ?dropped, "Deferred update queue full, dropping oldest");
                    }
                }
                self.pending.push_back(update);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Retry every parked update. Returns how many were applied.
    pub fn replay(&mut self, store: &mut dyn Store) -> usize {
        let mut applied = 0;
        let mut still_pending = VecDeque::new();
        for update in std::mem::take(&mut self.pending) {
            match update.apply(store) {
                Ok(()) => applied += 1,
                Err(RegistryError::UnknownNode(_)) => still_pending.push_back(update),
                Err(e) => warn!(update = ?update, error = %e, "Dropping deferred update"),
            }
        }
        self.pending = still_pending;
        applied
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use cstoken_core::store::MemoryStore;

    fn t(s: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(s)
    }

    fn seeded() -> MemoryStore {
        let mut store = MemoryStore::new();
        registry::register(&mut store, "5010".into(), "Lemon").unwrap();
        registry::register_under(&mut store, "5020".into(), "Orange", "5010".into()).unwrap();
        store
    }

    #[test]
    fn connect_then_disconnect_reports_both_events() {
        let mut store = seeded();
        let addr = NodeAddress::from("5010");

        let connected = connect(&mut store, &addr, "p1", t(0)).unwrap();
        assert_eq!(connected.connected_at, t(0));
        assert_eq!(connected.process_id, "p1");

        let disconnected = disconnect(&mut store, &addr, t(1)).unwrap();
        assert_eq!(disconnected.disconnected_at, t(1));

        let node = registry::lookup(&store, &addr).unwrap();
        assert!(!node.connected);
        assert_eq!(node.process_id, None);
        assert_eq!(node.disconnected_at, Some(t(1)));
    }

    #[test]
    fn disconnect_twice_yields_same_event() {
        let mut store = seeded();
        let addr = NodeAddress::from("5020");
        connect(&mut store, &addr, "p1", t(0)).unwrap();
        let first = disconnect(&mut store, &addr, t(1)).unwrap();
        let second = disconnect(&mut store, &addr, t(2)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn connectivity_leaves_parent_pointer_alone() {
        let mut store = seeded();
        let addr = NodeAddress::from("5020");
        connect(&mut store, &addr, "p1", t(0)).unwrap();
        disconnect(&mut store, &addr, t(1)).unwrap();
        assert_eq!(registry::lookup(&store, &addr).unwrap().parent, NodeAddress::from("5010"));
    }

    #[test]
    fn unknown_node_is_rejected() {
        let mut store = seeded();
        let addr = NodeAddress::from("9999");
        assert!(matches!(connect(&mut store, &addr, "p", t(0)), Err(RegistryError::UnknownNode(_))));
        assert!(matches!(disconnect(&mut store, &addr, t(0)), Err(RegistryError::UnknownNode(_))));
    }

    #[test]
    fn replicated_events_apply_their_own_timestamps() {
        let mut store = seeded();
        let event = ConnectedClient {
            source_ip: "5020".into(),
            connected_at: t(7),
            process_id: "remote".into(),
        };
        let node = apply_connected(&mut store, &event).unwrap().unwrap();
        assert_eq!(node.connected_at, Some(t(7)));
        assert_eq!(node.process_id.as_deref(), Some("remote"));
    }

    #[test]
    fn out_of_order_connectivity_keeps_the_newest_state() {
        let mut origin = seeded();
        let mut replica = seeded();
        let addr = NodeAddress::from("5010");
        let connected = connect(&mut origin, &addr, "p1", t(0)).unwrap();
        let disconnected = disconnect(&mut origin, &addr, t(1)).unwrap();

        assert!(apply_disconnected(&mut replica, &disconnected).unwrap().is_some());
        assert!(apply_connected(&mut replica, &connected).unwrap().is_none());

        let origin_node = registry::lookup(&origin, &addr).unwrap();
        let replica_node = registry::lookup(&replica, &addr).unwrap();
        assert!(!replica_node.connected);
        assert_eq!(replica_node.process_id, None);
        assert_eq!(replica_node.disconnected_at, origin_node.disconnected_at);
    }

    #[test]
    fn updates_for_unregistered_nodes_wait_for_the_registration() {
        let mut origin = seeded();
        let mut replica = seeded();
        registry::register_under(&mut origin, "5030".into(), "Lime", "5010".into()).unwrap();
        connect(&mut origin, &"5030".into(), "p3", t(0)).unwrap();
        reparent(&mut origin, &"5030".into(), &"5020".into()).unwrap();

        let mut deferred = DeferredUpdates::new(8);
        let updates = [
            ReplicatedUpdate::Reparented(Reparented {
                source_ip: "5030".into(),
                parent_ip: "5020".into(),
            }),
            ReplicatedUpdate::Connected(ConnectedClient {
                source_ip: "5030".into(),
                connected_at: t(0),
                process_id: "p3".into(),
            }),
        ];
        for update in updates {
            assert!(deferred.apply_or_defer(&mut replica, update).unwrap());
        }
        assert_eq!(deferred.len(), 2);
        assert_eq!(deferred.replay(&mut replica), 0);

        registry::register_under(&mut replica, "5030".into(), "Lime", "5010".into()).unwrap();
        assert_eq!(deferred.replay(&mut replica), 2);
        assert!(deferred.is_empty());
        assert_eq!(
            registry::lookup(&replica, &"5030".into()).unwrap(),
            registry::lookup(&origin, &"5030".into()).unwrap()
        );
    }

    #[test]
    fn deferred_queue_is_bounded() {
        let mut store = seeded();
        let mut deferred = DeferredUpdates::new(2);
        for n in 0..3 {
            let update = ReplicatedUpdate::Disconnected(DisconnectedClient {
                source_ip: format!("70{n}").as_str().into(),
                disconnected_at: t(n),
            });
            deferred.apply_or_defer(&mut store, update).unwrap();
        }
        assert_eq!(deferred.len(), 2);
    }
}
