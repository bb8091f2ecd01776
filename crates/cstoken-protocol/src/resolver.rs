//! Relay resolution: where does a hop processed at `source` go next?

use serde::{Deserialize, Serialize};

use cstoken_core::store::Store;
use cstoken_core::types::NodeAddress;

use crate::registry::{self, RegistryError};

/// Why a hop cannot move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum StallReason {
    /// Dynamic parent is down and the relay link offers nothing better.
    ParentDisconnected { parent: NodeAddress },
    /// Dynamic and static parents are both down.
    BothParentsDisconnected { parent: NodeAddress, static_parent: NodeAddress },
    /// The next relay already processed this chain. Mixing dynamic parents with
    /// static fallbacks can close a cycle.
    RelayLoop { next: NodeAddress },
}

impl std::fmt::Display for StallReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StallReason::ParentDisconnected { parent } => {
                write!(f, "parent {parent} disconnected, no distinct static parent")
            }
            StallReason::BothParentsDisconnected { parent, static_parent } => {
                write!(f, "parent {parent} and static parent {static_parent} disconnected")
            }
            StallReason::RelayLoop { next } => write!(f, "relay {next} already visited by this chain"),
        }
    }
}

/// Decision for one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// `source` is a root: the chain ends here.
    Deliver { root: NodeAddress },
    /// Relay to `next`. `via_static` when the relay link replaced a disconnected parent.
    Forward { next: NodeAddress, via_static: bool },
    Stalled { at: NodeAddress, reason: StallReason },
}

/// Resolve the next step for a hop whose `source_ip` is `source`.
pub fn resolve(store: &dyn Store, source: &NodeAddress) -> Result<Resolution, RegistryError> {
    let node = registry::lookup(store, source)?;
    if node.is_root() {
        return Ok(Resolution::Deliver { root: node.address });
    }

    let parent = registry::lookup(store, &node.parent)?;
    if parent.connected {
        return Ok(Resolution::Forward {
            next: parent.address,
            via_static: false,
        });
    }

    let link = registry::relay_link(store, source)?;
    // A self link belongs to a node created as a root; falling back to it would mint a second root.
    if link.static_parent == node.parent || link.static_parent == node.address {
        return Ok(Resolution::Stalled {
            at: node.address,
            reason: StallReason::ParentDisconnected { parent: parent.address },
        });
    }

    let static_parent = registry::lookup(store, &link.static_parent)?;
    if static_parent.connected {
        return Ok(Resolution::Forward {
            next: static_parent.address,
            via_static: true,
        });
    }

    Ok(Resolution::Stalled {
        at: node.address,
        reason: StallReason::BothParentsDisconnected {
            parent: parent.address,
            static_parent: static_parent.address,
        },
    })
}

/// Follow relay links from `address` up to the static root. Bounded by the registry size.
pub fn static_root_of(store: &dyn Store, address: &NodeAddress) -> Result<NodeAddress, RegistryError> {
    let limit = store.node_count()?;
    let mut cursor = address.clone();
    for _ in 0..=limit {
        let link = registry::relay_link(store, &cursor)?;
        if link.static_parent == cursor {
            return Ok(cursor);
        }
        cursor = link.static_parent;
    }
    // Relay links are written once at creation toward existing nodes, so they cannot loop.
    Err(RegistryError::CyclicParent {
        node: address.clone(),
        parent: cursor,
    })
}
