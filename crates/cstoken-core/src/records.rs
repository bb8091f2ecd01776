//! Persistent records and event payloads.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::{ChainId, NodeAddress, Timestamp};

// ─── Registry ────────────────────────────────────────────────────────

/// A participating node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub address: NodeAddress,
    pub name: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<Timestamp>,
    /// Present only while connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<Timestamp>,
    /// Dynamic parent. Equal to `address` for a root.
    pub parent: NodeAddress,
}

impl Node {
    /// A fresh, disconnected root.
    pub fn root(address: NodeAddress, name: impl Into<String>) -> Self {
        Self {
            parent: address.clone(),
            address,
            name: name.into(),
            connected: false,
            connected_at: None,
            process_id: None,
            disconnected_at: None,
        }
    }

    /// A fresh, disconnected node relaying toward `parent`.
    pub fn child(address: NodeAddress, name: impl Into<String>, parent: NodeAddress) -> Self {
        Self {
            parent,
            ..Self::root(address, name)
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent == self.address
    }
}

/// Static fallback path recorded once at node creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayLink {
    pub node: NodeAddress,
    pub static_parent: NodeAddress,
}

// ─── Connectivity ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedClient {
    pub source_ip: NodeAddress,
    pub connected_at: Timestamp,
    pub process_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectedClient {
    pub source_ip: NodeAddress,
    pub disconnected_at: Timestamp,
}

/// Administrative registration, replicated so every store learns the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredNode {
    pub node: Node,
    pub static_parent: NodeAddress,
}

/// Administrative parent-pointer change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reparented {
    pub source_ip: NodeAddress,
    pub parent_ip: NodeAddress,
}

// ─── Critical section ────────────────────────────────────────────────

/// One hop of a request chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsRequestHop {
    /// Node that must process this hop.
    pub source_ip: NodeAddress,
    /// Originator. Identical on every hop of a chain.
    pub original_ip: NodeAddress,
    pub parent_ip: NodeAddress,
    /// False only on the first hop.
    pub relayed: bool,
    pub requested_at: Timestamp,
    pub chain_id: ChainId,
    /// Nodes that already processed this chain, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub visited: Vec<NodeAddress>,
}

impl CsRequestHop {
    /// The hop names its own processor as parent only at the root.
    pub fn is_terminal(&self) -> bool {
        self.source_ip == self.parent_ip
    }

    /// Whether `address` already processed this chain, counting the current hop.
    pub fn has_visited(&self, address: &NodeAddress) -> bool {
        &self.source_ip == address || self.visited.contains(address)
    }
}

/// The token was granted by `ip` to `source_ip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsAcquire {
    pub ip: NodeAddress,
    pub source_ip: NodeAddress,
    pub acquired_at: Timestamp,
    pub chain_id: ChainId,
}

/// The holder `source_ip` returns the token of root `ip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsRelease {
    pub ip: NodeAddress,
    pub source_ip: NodeAddress,
    pub released_at: Timestamp,
}

/// A chain that could not make progress and was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StalledChain {
    pub chain_id: ChainId,
    pub original_ip: NodeAddress,
    pub stuck_at: NodeAddress,
    pub reason: String,
    pub attempts: u32,
    pub stalled_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub holder: NodeAddress,
    pub chain_id: ChainId,
    pub granted_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waiter {
    pub original_ip: NodeAddress,
    pub chain_id: ChainId,
    pub arrived_at: Timestamp,
}

/// Result of presenting a delivered chain to a [`TokenGuard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted(Grant),
    /// 1-based position in the waiting queue.
    Queued { position: usize },
    /// The chain, or another chain of the same originator, is already holding or waiting.
    Duplicate,
}

/// Result of a release attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handover {
    /// The caller was not the holder; nothing changed.
    NotHolder { holder: Option<NodeAddress> },
    /// The slot is now free.
    Freed,
    /// The next waiter was granted.
    Granted(Grant),
}

/// Single-slot holder guard of one root, with a FIFO of waiting chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGuard {
    pub root: NodeAddress,
    pub holder: Option<Grant>,
    pub waiting: VecDeque<Waiter>,
}

impl TokenGuard {
    pub fn new(root: NodeAddress) -> Self {
        Self {
            root,
            holder: None,
            waiting: VecDeque::new(),
        }
    }

    /// Admit a chain that reached the root.
    pub fn admit(&mut self, original_ip: &NodeAddress, chain_id: &ChainId, now: Timestamp) -> Admission {
        let holding = self
            .holder
            .as_ref()
            .is_some_and(|g| &g.chain_id == chain_id || &g.holder == original_ip);
        let waiting = self
            .waiting
            .iter()
            .any(|w| &w.chain_id == chain_id || &w.original_ip == original_ip);
        if holding || waiting {
            return Admission::Duplicate;
        }

        if self.holder.is_none() {
            let grant = Grant {
                holder: original_ip.clone(),
                chain_id: chain_id.clone(),
                granted_at: now,
            };
            self.holder = Some(grant.clone());
            return Admission::Granted(grant);
        }

        self.waiting.push_back(Waiter {
            original_ip: original_ip.clone(),
            chain_id: chain_id.clone(),
            arrived_at: now,
        });
        Admission::Queued {
            position: self.waiting.len(),
        }
    }

    /// Release the slot held by `holder` and hand it to the next waiter.
    pub fn release(&mut self, holder: &NodeAddress, now: Timestamp) -> Handover {
        match &self.holder {
            Some(grant) if &grant.holder == holder => {}
            other => {
                return Handover::NotHolder {
                    holder: other.as_ref().map(|g| g.holder.clone()),
                };
            }
        }

        self.holder = self.waiting.pop_front().map(|w| Grant {
            holder: w.original_ip,
            chain_id: w.chain_id,
            granted_at: now,
        });
        match &self.holder {
            Some(grant) => Handover::Granted(grant.clone()),
            None => Handover::Freed,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiting.is_empty()
    }
}

// ─── Task distribution ───────────────────────────────────────────────

/// The single task-manager role, held until `expires_at` unless renewed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskManagerLease {
    pub holder: String,
    pub holder_name: String,
    pub granted_at: Timestamp,
    pub expires_at: Timestamp,
}

impl TaskManagerLease {
    pub fn is_live(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// A chunk of the board handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: u64,
    pub gen_id: String,
    /// First board row covered by the chunk.
    pub row: usize,
    pub length: usize,
    pub rows: Vec<Vec<u8>>,
    /// Board row just above the chunk, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above: Option<Vec<u8>>,
    /// Board row just below the chunk, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below: Option<Vec<u8>>,
    pub allocated: bool,
}

/// A computed chunk posted back by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub id: u64,
    pub gen_id: String,
    pub row: usize,
    pub length: usize,
    pub rows: Vec<Vec<u8>>,
}

/// A full board of one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub gen_id: String,
    pub rows: usize,
    pub cols: usize,
    pub board: Vec<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn t(s: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + s, 0).unwrap()
    }

    fn addr(s: &str) -> NodeAddress {
        NodeAddress::from(s)
    }

    #[test]
    fn node_wire_shape_is_camel_case() {
        let mut node = Node::root(addr("5010"), "Lemon");
        node.connected = true;
        node.process_id = Some("p1".into());
        node.connected_at = Some(t(0));
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["processId"], "p1");
        assert_eq!(json["parent"], "5010");
        assert!(json.get("disconnectedAt").is_none());
    }

    #[test]
    fn hop_wire_shape_is_camel_case() {
        let hop = CsRequestHop {
            source_ip: addr("5080"),
            original_ip: addr("5080"),
            parent_ip: addr("5010"),
            relayed: false,
            requested_at: t(0),
            chain_id: ChainId::from("c1"),
            visited: Vec::new(),
        };
        let json = serde_json::to_value(&hop).unwrap();
        for key in ["sourceIp", "originalIp", "parentIp", "relayed", "requestedAt", "chainId"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        // The first hop carries no path on the wire.
        assert!(json.get("visited").is_none());
        assert!(!hop.is_terminal());
        assert!(hop.has_visited(&addr("5080")));
        assert!(!hop.has_visited(&addr("5010")));
    }

    #[test]
    fn guard_grants_then_queues_fifo() {
        let mut guard = TokenGuard::new(addr("5010"));
        let first = guard.admit(&addr("5080"), &ChainId::from("a"), t(0));
        assert!(matches!(first, Admission::Granted(ref g) if g.holder == addr("5080")));

        assert_eq!(
            guard.admit(&addr("5070"), &ChainId::from("b"), t(1)),
            Admission::Queued { position: 1 }
        );
        assert_eq!(
            guard.admit(&addr("5060"), &ChainId::from("c"), t(2)),
            Admission::Queued { position: 2 }
        );

        match guard.release(&addr("5080"), t(3)) {
            Handover::Granted(grant) => {
                assert_eq!(grant.holder, addr("5070"));
                assert_eq!(grant.granted_at, t(3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(guard.release(&addr("5070"), t(4)), Handover::Granted(_)));
        assert_eq!(guard.release(&addr("5060"), t(5)), Handover::Freed);
        assert!(guard.is_idle());
    }

    #[test]
    fn guard_ignores_duplicate_delivery() {
        let mut guard = TokenGuard::new(addr("5010"));
        guard.admit(&addr("5080"), &ChainId::from("a"), t(0));
        guard.admit(&addr("5070"), &ChainId::from("b"), t(1));
        assert_eq!(guard.admit(&addr("5080"), &ChainId::from("a"), t(2)), Admission::Duplicate);
        assert_eq!(guard.admit(&addr("5070"), &ChainId::from("b"), t(2)), Admission::Duplicate);
        // A resubmitted chain of a waiting originator is the same request.
        assert_eq!(guard.admit(&addr("5070"), &ChainId::from("b2"), t(2)), Admission::Duplicate);
        assert_eq!(guard.waiting.len(), 1);
    }

    #[test]
    fn guard_refuses_release_from_non_holder() {
        let mut guard = TokenGuard::new(addr("5010"));
        assert_eq!(
            guard.release(&addr("5080"), t(0)),
            Handover::NotHolder { holder: None }
        );
        guard.admit(&addr("5080"), &ChainId::from("a"), t(0));
        assert_eq!(
            guard.release(&addr("5070"), t(1)),
            Handover::NotHolder { holder: Some(addr("5080")) }
        );
        assert!(guard.holder.is_some());
    }

    #[test]
    fn lease_liveness() {
        let lease = TaskManagerLease {
            holder: "n1".into(),
            holder_name: "Lemon".into(),
            granted_at: t(0),
            expires_at: t(60),
        };
        assert!(lease.is_live(t(59)));
        assert!(!lease.is_live(t(60)));
    }
}
