//! Request/acquire protocol.
//!
//! A chain starts with [`submit`], moves one hop per [`handle_hop`] call toward the
//! root of its originator's tree, and ends at the root's [`TokenGuard`], which grants
//! the token to one chain at a time and queues the rest in arrival order. The holder
//! hands the token back with [`release`].
//!
//! Relay hops are processed by whichever runtime serves the hop's `source_ip`; chains
//! never coordinate with each other outside the guard.

use tracing::{debug, info, warn};

use cstoken_core::records::{
    Admission, CsAcquire, CsRelease, CsRequestHop, Grant, Handover, TokenGuard,
};
use cstoken_core::store::{Store, StoreError};
use cstoken_core::types::{ChainId, NodeAddress, Timestamp};

use crate::registry::{self, RegistryError};
use crate::resolver::{self, Resolution, StallReason};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{claimed} does not hold the token of {root} (holder: {holder:?})")]
    NotHolder {
        root: NodeAddress,
        claimed: NodeAddress,
        holder: Option<NodeAddress>,
    },
}

/// A hop that could not move, with the diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledHop {
    pub hop: CsRequestHop,
    pub at: NodeAddress,
    pub reason: StallReason,
}

/// What processing one hop produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopOutcome {
    /// Publish this next hop.
    Forwarded(CsRequestHop),
    /// The root granted the token. Publish the acquire.
    Granted(CsAcquire),
    /// The root's slot is taken; the chain waits in its queue.
    Queued { root: NodeAddress, position: usize },
    /// Redelivery of a chain the root already knows.
    Duplicate { root: NodeAddress },
    Stalled(StalledHop),
}

/// Start a chain from `original_ip`.
pub fn submit(store: &dyn Store, original_ip: &NodeAddress, now: Timestamp) -> Result<CsRequestHop, ProtocolError> {
    registry::lookup(store, original_ip)?;
    let link = registry::relay_link(store, original_ip)?;
    let hop = CsRequestHop {
        source_ip: original_ip.clone(),
        original_ip: original_ip.clone(),
        parent_ip: link.static_parent,
        relayed: false,
        requested_at: now,
        chain_id: ChainId::derive(original_ip, now),
        visited: Vec::new(),
    };
    info!(chain = %hop.chain_id, original = %original_ip, parent = %hop.parent_ip, "Request submitted");
    Ok(hop)
}

/// Process a hop at the node named by its `source_ip`.
pub fn handle_hop(store: &mut dyn Store, hop: &CsRequestHop, now: Timestamp) -> Result<HopOutcome, ProtocolError> {
    match resolver::resolve(store, &hop.source_ip)? {
        Resolution::Deliver { root } => arrive_at_root(store, &root, hop, now),
        Resolution::Forward { next, .. } if hop.has_visited(&next) => {
            let reason = StallReason::RelayLoop { next };
            warn!(chain = %hop.chain_id, at = %hop.source_ip, reason = %reason, "Request chain stalled");
            Ok(HopOutcome::Stalled(StalledHop {
                hop: hop.clone(),
                at: hop.source_ip.clone(),
                reason,
            }))
        }
        Resolution::Forward { next, via_static } => {
            let next_hop = relay_to(store, hop, &next, now)?;
            debug!(
                chain = %hop.chain_id,
                from = %hop.source_ip,
                to = %next,
                via_static,
                "Relaying request"
            );
            Ok(HopOutcome::Forwarded(next_hop))
        }
        Resolution::Stalled { at, reason } => {
            warn!(chain = %hop.chain_id, at = %at, reason = %reason, "Request chain stalled");
            Ok(HopOutcome::Stalled(StalledHop {
                hop: hop.clone(),
                at,
                reason,
            }))
        }
    }
}

/// Skip the remaining relays and hand the hop straight to the static root of its
/// originator, if that root is connected. Last resort for a stalled chain.
pub fn forward_to_static_root(
    store: &dyn Store,
    hop: &CsRequestHop,
    now: Timestamp,
) -> Result<Option<CsRequestHop>, ProtocolError> {
    let root = resolver::static_root_of(store, &hop.original_ip)?;
    let node = registry::lookup(store, &root)?;
    if !node.connected || root == hop.source_ip {
        return Ok(None);
    }
    let next_hop = relay_to(store, hop, &root, now)?;
    info!(chain = %hop.chain_id, root = %root, "Forwarding stalled request to static root");
    Ok(Some(next_hop))
}

fn relay_to(store: &dyn Store, hop: &CsRequestHop, next: &NodeAddress, now: Timestamp) -> Result<CsRequestHop, ProtocolError> {
    let next_node = registry::lookup(store, next)?;
    let mut visited = hop.visited.clone();
    visited.push(hop.source_ip.clone());
    Ok(CsRequestHop {
        source_ip: next_node.address,
        original_ip: hop.original_ip.clone(),
        parent_ip: next_node.parent,
        relayed: true,
        requested_at: now,
        chain_id: hop.chain_id.clone(),
        visited,
    })
}

fn arrive_at_root(
    store: &mut dyn Store,
    root: &NodeAddress,
    hop: &CsRequestHop,
    now: Timestamp,
) -> Result<HopOutcome, ProtocolError> {
    let mut guard = store
        .token_guard(root)?
        .unwrap_or_else(|| TokenGuard::new(root.clone()));

    let outcome = match guard.admit(&hop.original_ip, &hop.chain_id, now) {
        Admission::Granted(grant) => {
            info!(chain = %hop.chain_id, root = %root, holder = %grant.holder, "Token granted");
            HopOutcome::Granted(acquire(root, &grant))
        }
        Admission::Queued { position } => {
            info!(chain = %hop.chain_id, root = %root, original = %hop.original_ip, position, "Token busy, request queued");
            HopOutcome::Queued {
                root: root.clone(),
                position,
            }
        }
        Admission::Duplicate => {
            debug!(chain = %hop.chain_id, root = %root, "Duplicate delivery ignored");
            return Ok(HopOutcome::Duplicate { root: root.clone() });
        }
    };
    store.put_token_guard(guard)?;
    Ok(outcome)
}

fn acquire(root: &NodeAddress, grant: &Grant) -> CsAcquire {
    CsAcquire {
        ip: root.clone(),
        source_ip: grant.holder.clone(),
        acquired_at: grant.granted_at,
        chain_id: grant.chain_id.clone(),
    }
}

/// Build the release record the holder publishes.
pub fn release_record(root: &NodeAddress, holder: &NodeAddress, now: Timestamp) -> CsRelease {
    CsRelease {
        ip: root.clone(),
        source_ip: holder.clone(),
        released_at: now,
    }
}

/// Apply a release at the root. Returns the acquire of the next waiter, if any.
pub fn release(store: &mut dyn Store, release: &CsRelease) -> Result<Option<CsAcquire>, ProtocolError> {
    let root = &release.ip;
    let mut guard = store
        .token_guard(root)?
        .unwrap_or_else(|| TokenGuard::new(root.clone()));

    let next = match guard.release(&release.source_ip, release.released_at) {
        Handover::NotHolder { holder } => {
            return Err(ProtocolError::NotHolder {
                root: root.clone(),
                claimed: release.source_ip.clone(),
                holder,
            });
        }
        Handover::Freed => {
            info!(root = %root, holder = %release.source_ip, "Token released, slot free");
            None
        }
        Handover::Granted(grant) => {
            info!(root = %root, previous = %release.source_ip, holder = %grant.holder, "Token handed to next waiter");
            Some(acquire(root, &grant))
        }
    };
    store.put_token_guard(guard)?;
    Ok(next)
}

/// Current holder of a root's token.
pub fn holder_of(store: &dyn Store, root: &NodeAddress) -> Result<Option<Grant>, ProtocolError> {
    Ok(store.token_guard(root)?.and_then(|g| g.holder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use cstoken_core::store::MemoryStore;

    fn t(s: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(s)
    }

    fn a(s: &str) -> NodeAddress {
        NodeAddress::from(s)
    }

    /// 5010 root with 5020..5080 directly under it, all connected.
    fn star() -> MemoryStore {
        let mut store = MemoryStore::new();
        registry::register(&mut store, a("5010"), "Lemon").unwrap();
        for addr in ["5020", "5030", "5040", "5050", "5060", "5070", "5080"] {
            registry::register_under(&mut store, a(addr), addr, a("5010")).unwrap();
        }
        for addr in ["5010", "5020", "5030", "5040", "5050", "5060", "5070", "5080"] {
            registry::set_connected(&mut store, &a(addr), "p", t(0)).unwrap();
        }
        store
    }

    /// Run a chain until it leaves the relay phase.
    fn drive(store: &mut MemoryStore, first: CsRequestHop, now: Timestamp) -> (Vec<CsRequestHop>, HopOutcome) {
        let mut hops = vec![first];
        loop {
            let current = hops.last().cloned().unwrap();
            match handle_hop(store, &current, now).unwrap() {
                HopOutcome::Forwarded(next) => hops.push(next),
                other => return (hops, other),
            }
        }
    }

    #[test]
    fn submit_builds_first_hop() {
        let store = star();
        let hop = submit(&store, &a("5080"), t(1)).unwrap();
        assert_eq!(hop.source_ip, a("5080"));
        assert_eq!(hop.original_ip, a("5080"));
        assert_eq!(hop.parent_ip, a("5010"));
        assert!(!hop.relayed);
    }

    #[test]
    fn submit_from_unknown_node_fails() {
        let store = star();
        assert!(matches!(
            submit(&store, &a("9999"), t(1)),
            Err(ProtocolError::Registry(RegistryError::UnknownNode(_)))
        ));
    }

    #[test]
    fn one_relay_then_acquire() {
        let mut store = star();
        let first = submit(&store, &a("5080"), t(1)).unwrap();
        let (hops, outcome) = drive(&mut store, first, t(1));

        assert_eq!(hops.len(), 2);
        assert!(hops[1].relayed);
        assert_eq!(hops[1].source_ip, a("5010"));
        assert!(hops[1].is_terminal());
        match outcome {
            HopOutcome::Granted(acq) => {
                assert_eq!(acq.ip, a("5010"));
                assert_eq!(acq.source_ip, a("5080"));
                assert_eq!(acq.chain_id, hops[0].chain_id);
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn root_requesting_for_itself_is_granted_without_relay() {
        let mut store = star();
        let first = submit(&store, &a("5010"), t(1)).unwrap();
        let (hops, outcome) = drive(&mut store, first, t(1));
        assert_eq!(hops.len(), 1);
        assert!(matches!(outcome, HopOutcome::Granted(ref acq) if acq.source_ip == a("5010")));
    }

    #[test]
    fn second_chain_waits_for_release() {
        let mut store = star();
        let first = submit(&store, &a("5080"), t(1)).unwrap();
        let (_, outcome) = drive(&mut store, first, t(1));
        assert!(matches!(outcome, HopOutcome::Granted(_)));

        let second = submit(&store, &a("5070"), t(2)).unwrap();
        let (_, outcome) = drive(&mut store, second.clone(), t(2));
        assert_eq!(outcome, HopOutcome::Queued { root: a("5010"), position: 1 });

        let next = release(&mut store, &release_record(&a("5010"), &a("5080"), t(3)))
            .unwrap()
            .unwrap();
        assert_eq!(next.source_ip, a("5070"));
        assert_eq!(next.chain_id, second.chain_id);
        assert_eq!(holder_of(&store, &a("5010")).unwrap().unwrap().holder, a("5070"));

        assert_eq!(
            release(&mut store, &release_record(&a("5010"), &a("5070"), t(4))).unwrap(),
            None
        );
        assert!(holder_of(&store, &a("5010")).unwrap().is_none());
    }

    #[test]
    fn release_by_non_holder_is_rejected() {
        let mut store = star();
        let first = submit(&store, &a("5080"), t(1)).unwrap();
        drive(&mut store, first, t(1));
        let err = release(&mut store, &release_record(&a("5010"), &a("5070"), t(2))).unwrap_err();
        assert!(matches!(err, ProtocolError::NotHolder { holder: Some(ref h), .. } if *h == a("5080")));
    }

    #[test]
    fn redelivered_terminal_hop_is_ignored() {
        let mut store = star();
        let first = submit(&store, &a("5080"), t(1)).unwrap();
        let (hops, _) = drive(&mut store, first, t(1));
        let again = handle_hop(&mut store, hops.last().unwrap(), t(2)).unwrap();
        assert_eq!(again, HopOutcome::Duplicate { root: a("5010") });
    }

    #[test]
    fn stalled_hop_reports_reason() {
        let mut store = star();
        registry::set_disconnected(&mut store, &a("5010"), t(1)).unwrap();
        let first = submit(&store, &a("5080"), t(2)).unwrap();
        match handle_hop(&mut store, &first, t(2)).unwrap() {
            HopOutcome::Stalled(stalled) => {
                assert_eq!(stalled.at, a("5080"));
                assert_eq!(stalled.hop, first);
            }
            other => panic!("expected stall, got {other:?}"),
        }
    }

    #[test]
    fn static_fallback_into_a_visited_node_stalls_instead_of_looping() {
        let mut store = MemoryStore::new();
        registry::register(&mut store, a("5010"), "root").unwrap();
        registry::register_under(&mut store, a("5020"), "mid", a("5010")).unwrap();
        registry::register_under(&mut store, a("5030"), "leaf", a("5020")).unwrap();
        registry::register_under(&mut store, a("5040"), "side", a("5010")).unwrap();
        for addr in ["5010", "5020", "5030", "5040"] {
            registry::set_connected(&mut store, &a(addr), "p", t(0)).unwrap();
        }
        // 5030 falls back to its relay link 5020, whose dynamic parent is 5030 again.
        registry::set_parent(&mut store, &a("5030"), &a("5040")).unwrap();
        registry::set_parent(&mut store, &a("5020"), &a("5030")).unwrap();
        registry::set_disconnected(&mut store, &a("5040"), t(0)).unwrap();

        let first = submit(&store, &a("5030"), t(1)).unwrap();
        let (hops, outcome) = drive(&mut store, first, t(1));
        let path: Vec<&str> = hops.iter().map(|h| h.source_ip.as_str()).collect();
        assert_eq!(path, vec!["5030", "5020"]);
        assert_eq!(hops[1].visited, vec![a("5030")]);

        let stalled = match outcome {
            HopOutcome::Stalled(stalled) => stalled,
            other => panic!("expected stall, got {other:?}"),
        };
        assert_eq!(stalled.at, a("5020"));
        assert_eq!(stalled.reason, StallReason::RelayLoop { next: a("5030") });

        // The static root still reaches the token.
        let shortcut = forward_to_static_root(&store, &stalled.hop, t(2)).unwrap().unwrap();
        assert_eq!(shortcut.visited, vec![a("5030"), a("5020")]);
        let granted = handle_hop(&mut store, &shortcut, t(2)).unwrap();
        assert!(matches!(granted, HopOutcome::Granted(ref acq) if acq.source_ip == a("5030")));
    }

    #[test]
    fn static_root_shortcut_requires_connected_root() {
        let mut store = MemoryStore::new();
        registry::register(&mut store, a("5010"), "root").unwrap();
        registry::register_under(&mut store, a("5020"), "mid", a("5010")).unwrap();
        registry::register_under(&mut store, a("5030"), "leaf", a("5020")).unwrap();
        registry::set_connected(&mut store, &a("5030"), "p", t(0)).unwrap();

        let hop = submit(&store, &a("5030"), t(1)).unwrap();
        assert_eq!(forward_to_static_root(&store, &hop, t(1)).unwrap(), None);

        registry::set_connected(&mut store, &a("5010"), "p", t(2)).unwrap();
        let shortcut = forward_to_static_root(&store, &hop, t(3)).unwrap().unwrap();
        assert_eq!(shortcut.source_ip, a("5010"));
        assert_eq!(shortcut.original_ip, a("5030"));
        assert!(shortcut.relayed);
    }
}
