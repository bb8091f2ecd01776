//! Node registry: creation, lookup, range listing, connectivity flags and parent pointers.
//!
//! Every node has exactly one parent pointer (itself for a root) and exactly one
//! relay link recorded at creation. The parent relation stays acyclic apart from the
//! root self-loop.

use tracing::{debug, info};

use cstoken_core::records::{Node, RegisteredNode, RelayLink};
use cstoken_core::store::{Store, StoreError};
use cstoken_core::types::{NodeAddress, Timestamp};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Node {0} is already registered")]
    DuplicateNode(NodeAddress),
    #[error("Node {0} is not registered")]
    UnknownNode(NodeAddress),
    #[error("Parent {parent} would make {node} its own ancestor")]
    CyclicParent { node: NodeAddress, parent: NodeAddress },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Register a new root: parent = self, relay link to self.
pub fn register(store: &mut dyn Store, address: NodeAddress, name: &str) -> Result<Node, RegistryError> {
    let node = Node::root(address.clone(), name);
    insert(store, node, address)
}

/// Register a node relaying toward an existing `parent`.
pub fn register_under(
    store: &mut dyn Store,
    address: NodeAddress,
    name: &str,
    parent: NodeAddress,
) -> Result<Node, RegistryError> {
    if parent == address {
        return register(store, address, name);
    }
    lookup(store, &parent)?;
    let node = Node::child(address, name, parent.clone());
    insert(store, node, parent)
}

fn insert(store: &mut dyn Store, node: Node, static_parent: NodeAddress) -> Result<Node, RegistryError> {
    let link = RelayLink {
        node: node.address.clone(),
        static_parent,
    };
    match store.insert_node(node.clone(), link) {
        Ok(()) => {
            info!(node = %node.address, parent = %node.parent, name = %node.name, "Registered node");
            Ok(node)
        }
        Err(StoreError::Conflict(_)) => Err(RegistryError::DuplicateNode(node.address)),
        Err(e) => Err(e.into()),
    }
}

/// Record a registration replicated from another runtime. Returns false when the
/// address is already known locally.
pub fn apply_registered(store: &mut dyn Store, event: &RegisteredNode) -> Result<bool, RegistryError> {
    if find(store, &event.node.address)?.is_some() {
        return Ok(false);
    }
    let link = RelayLink {
        node: event.node.address.clone(),
        static_parent: event.static_parent.clone(),
    };
    match store.insert_node(event.node.clone(), link) {
        Ok(()) => {
            debug!(node = %event.node.address, parent = %event.node.parent, "Replicated registration");
            Ok(true)
        }
        Err(StoreError::Conflict(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Point lookup. `None` when the address was never registered.
pub fn find(store: &dyn Store, address: &NodeAddress) -> Result<Option<Node>, RegistryError> {
    Ok(store.node(address)?)
}

/// Point lookup that treats a missing node as an error.
pub fn lookup(store: &dyn Store, address: &NodeAddress) -> Result<Node, RegistryError> {
    find(store, address)?.ok_or_else(|| RegistryError::UnknownNode(address.clone()))
}

pub fn relay_link(store: &dyn Store, address: &NodeAddress) -> Result<RelayLink, RegistryError> {
    store
        .relay_link(address)?
        .ok_or_else(|| RegistryError::UnknownNode(address.clone()))
}

/// Nodes with `low <= address <= high`, ascending. Empty when nothing matches.
pub fn list_in_range(store: &dyn Store, low: &NodeAddress, high: &NodeAddress) -> Result<Vec<Node>, RegistryError> {
    Ok(store.nodes_in_range(low, high)?)
}

/// Mark a node connected under `process_id`. Re-applying the same state is a no-op.
pub fn set_connected(
    store: &mut dyn Store,
    address: &NodeAddress,
    process_id: &str,
    at: Timestamp,
) -> Result<Node, RegistryError> {
    let mut node = lookup(store, address)?;
    if node.connected && node.process_id.as_deref() == Some(process_id) {
        debug!(node = %address, process_id, "Already connected");
        return Ok(node);
    }
    node.connected = true;
    node.connected_at = Some(at);
    node.process_id = Some(process_id.to_string());
    store.update_node(node.clone())?;
    info!(node = %address, process_id, "Node connected");
    Ok(node)
}

/// Mark a node disconnected and drop its process id. Re-applying is a no-op.
pub fn set_disconnected(store: &mut dyn Store, address: &NodeAddress, at: Timestamp) -> Result<Node, RegistryError> {
    let mut node = lookup(store, address)?;
    if !node.connected && node.disconnected_at.is_some() {
        debug!(node = %address, "Already disconnected");
        return Ok(node);
    }
    node.connected = false;
    node.process_id = None;
    node.disconnected_at = Some(at);
    store.update_node(node.clone())?;
    info!(node = %address, "Node disconnected");
    Ok(node)
}

/// Move a node's dynamic parent pointer. Rejects pointers that would close a cycle.
pub fn set_parent(store: &mut dyn Store, address: &NodeAddress, parent: &NodeAddress) -> Result<Node, RegistryError> {
    let mut node = lookup(store, address)?;
    lookup(store, parent)?;

    if parent != address {
        // Walk up from the new parent; meeting `address` means a cycle.
        let limit = store.node_count()? + 1;
        let mut cursor = parent.clone();
        for _ in 0..limit {
            if &cursor == address {
                return Err(RegistryError::CyclicParent {
                    node: address.clone(),
                    parent: parent.clone(),
                });
            }
            let current = lookup(store, &cursor)?;
            if current.is_root() {
                break;
            }
            cursor = current.parent;
        }
    }

    if &node.parent == parent {
        return Ok(node);
    }
    node.parent = parent.clone();
    store.update_node(node.clone())?;
    info!(node = %address, parent = %parent, "Parent pointer updated");
    Ok(node)
}
