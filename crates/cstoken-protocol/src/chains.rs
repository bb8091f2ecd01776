//! Chain bookkeeping outside the guard: originator deadlines and relay-side stall retries.

use std::collections::BTreeMap;

use chrono::Duration;
use tracing::{debug, error, info, warn};

use cstoken_core::records::{CsAcquire, CsRequestHop, StalledChain};
use cstoken_core::store::Store;
use cstoken_core::types::{ChainId, NodeAddress, Timestamp};

use crate::mutex::{self, HopOutcome, StalledHop};

// ─── Originator deadlines ────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingChain {
    original_ip: NodeAddress,
    last_progress: Timestamp,
    /// Longest relay path observed. Only a longer one counts as progress.
    furthest: usize,
    resubmits: u32,
    /// Reached the root. Queued chains wait as long as the holder keeps the token.
    delivered: bool,
}

/// What to do with a chain whose deadline passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadlineAction {
    /// Submit a fresh chain for the same originator.
    Resubmit { original_ip: NodeAddress, resubmits: u32 },
    /// Give up; the resubmit budget is spent.
    Abandon { chain_id: ChainId, original_ip: NodeAddress },
}

/// Chains submitted by this runtime that have not been granted yet.
#[derive(Debug)]
pub struct ChainTracker {
    chains: BTreeMap<ChainId, PendingChain>,
    deadline: Duration,
    max_resubmits: u32,
}

impl ChainTracker {
    pub fn new(deadline: Duration, max_resubmits: u32) -> Self {
        Self {
            chains: BTreeMap::new(),
            deadline,
            max_resubmits,
        }
    }

    /// Start tracking a freshly submitted chain.
    pub fn track(&mut self, first_hop: &CsRequestHop, resubmits: u32) {
        self.chains.insert(
            first_hop.chain_id.clone(),
            PendingChain {
                original_ip: first_hop.original_ip.clone(),
                last_progress: first_hop.requested_at,
                furthest: 0,
                resubmits,
                delivered: false,
            },
        );
    }

    /// Note a hop of one of our chains. A hop further along than any seen before
    /// counts as progress; terminal hops mark the chain delivered.
    pub fn observe_hop(&mut self, hop: &CsRequestHop, now: Timestamp) {
        if let Some(chain) = self.chains.get_mut(&hop.chain_id) {
            if hop.visited.len() > chain.furthest {
                chain.furthest = hop.visited.len();
                chain.last_progress = now;
            }
            if hop.is_terminal() {
                chain.delivered = true;
            }
        }
    }

    /// Stop tracking every chain of the granted originator. Returns how many were dropped.
    pub fn observe_acquired(&mut self, acquire: &CsAcquire) -> usize {
        let before = self.chains.len();
        self.chains.retain(|_, c| c.original_ip != acquire.source_ip);
        before - self.chains.len()
    }

    pub fn observe_stalled(&mut self, chain_id: &ChainId) -> bool {
        self.chains.remove(chain_id).is_some()
    }

    /// Pop chains that made no progress within the deadline.
    pub fn expire(&mut self, now: Timestamp) -> Vec<DeadlineAction> {
        let expired: Vec<ChainId> = self
            .chains
            .iter()
            .filter(|(_, c)| !c.delivered && now - c.last_progress >= self.deadline)
            .map(|(id, _)| id.clone())
            .collect();

        let mut actions = Vec::with_capacity(expired.len());
        for chain_id in expired {
            let Some(chain) = self.chains.remove(&chain_id) else {
                continue;
            };
            if chain.resubmits < self.max_resubmits {
                warn!(chain = %chain_id, original = %chain.original_ip, attempt = chain.resubmits + 1, "Chain deadline passed, resubmitting");
                actions.push(DeadlineAction::Resubmit {
                    original_ip: chain.original_ip,
                    resubmits: chain.resubmits + 1,
                });
            } else {
                error!(chain = %chain_id, original = %chain.original_ip, "Chain deadline passed, resubmit budget spent");
                actions.push(DeadlineAction::Abandon {
                    chain_id,
                    original_ip: chain.original_ip,
                });
            }
        }
        actions
    }

    pub fn is_tracking(&self, chain_id: &ChainId) -> bool {
        self.chains.contains_key(chain_id)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

// ─── Relay-side stall retries ────────────────────────────────────────

#[derive(Debug, Clone)]
struct StalledEntry {
    hop: CsRequestHop,
    at: NodeAddress,
    reason: String,
    attempts: u32,
}

/// Hops this runtime could not relay, retried on every maintenance tick.
#[derive(Debug)]
pub struct StallTracker {
    entries: BTreeMap<ChainId, StalledEntry>,
    max_relay_retries: u32,
}

/// Result of one retry pass for one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The chain moved again. Publish the hop.
    Forwarded(CsRequestHop),
    /// The retry reached the root and was granted. Publish the acquire.
    Granted(CsAcquire),
    /// Reached the root but queued or already known there.
    Settled(ChainId),
    StillStalled { chain_id: ChainId, attempts: u32 },
    /// Retries spent; the hop was sent straight to the static root.
    Shortcut(CsRequestHop),
    /// Retries spent and no static root reachable. Publish the failure.
    Abandoned(StalledChain),
}

impl StallTracker {
    pub fn new(max_relay_retries: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_relay_retries,
        }
    }

    /// Record a stall. Returns the number of failed attempts so far.
    pub fn record(&mut self, stalled: &StalledHop) -> u32 {
        let entry = self
            .entries
            .entry(stalled.hop.chain_id.clone())
            .or_insert_with(|| StalledEntry {
                hop: stalled.hop.clone(),
                at: stalled.at.clone(),
                reason: stalled.reason.to_string(),
                attempts: 0,
            });
        entry.attempts += 1;
        entry.at = stalled.at.clone();
        entry.reason = stalled.reason.to_string();
        entry.attempts
    }

    pub fn clear(&mut self, chain_id: &ChainId) -> bool {
        self.entries.remove(chain_id).is_some()
    }

    pub fn contains(&self, chain_id: &ChainId) -> bool {
        self.entries.contains_key(chain_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retry every stalled hop once. Chains out of retries fall back to the static
    /// root of their originator, then are abandoned. A store failure on one chain
    /// keeps it parked and does not stop the pass.
    pub fn retry(&mut self, store: &mut dyn Store, now: Timestamp) -> Vec<RetryOutcome> {
        let pending: Vec<CsRequestHop> = self.entries.values().map(|e| e.hop.clone()).collect();
        let mut outcomes = Vec::with_capacity(pending.len());

        for hop in pending {
            let chain_id = hop.chain_id.clone();
            let outcome = match mutex::handle_hop(store, &hop, now) {
                Ok(HopOutcome::Forwarded(next)) => {
                    self.clear(&chain_id);
                    info!(chain = %chain_id, to = %next.source_ip, "Stalled chain moving again");
                    RetryOutcome::Forwarded(next)
                }
                Ok(HopOutcome::Granted(acquire)) => {
                    self.clear(&chain_id);
                    RetryOutcome::Granted(acquire)
                }
                Ok(HopOutcome::Queued { .. } | HopOutcome::Duplicate { .. }) => {
                    self.clear(&chain_id);
                    RetryOutcome::Settled(chain_id)
                }
                Ok(HopOutcome::Stalled(stalled)) => {
                    let attempts = self.record(&stalled);
                    if attempts <= self.max_relay_retries {
                        debug!(chain = %chain_id, attempts, "Chain still stalled");
                        RetryOutcome::StillStalled { chain_id, attempts }
                    } else {
                        self.give_up(store, &hop, attempts, now)
                    }
                }
                Err(e) => {
                    warn!(chain = %chain_id, error = %e, "Stalled chain retry failed");
                    let attempts = self.entries.get(&chain_id).map_or(0, |entry| entry.attempts);
                    RetryOutcome::StillStalled { chain_id, attempts }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    fn give_up(&mut self, store: &dyn Store, hop: &CsRequestHop, attempts: u32, now: Timestamp) -> RetryOutcome {
        let shortcut = match mutex::forward_to_static_root(store, hop, now) {
            Ok(shortcut) => shortcut,
            Err(e) => {
                warn!(chain = %hop.chain_id, error = %e, "Static root fallback failed, chain stays parked");
                return RetryOutcome::StillStalled {
                    chain_id: hop.chain_id.clone(),
                    attempts,
                };
            }
        };
        let entry = self.entries.remove(&hop.chain_id);
        if let Some(shortcut) = shortcut {
            return RetryOutcome::Shortcut(shortcut);
        }
        let (at, reason) = match entry {
            Some(e) => (e.at, e.reason),
            None => (hop.source_ip.clone(), "stalled".to_string()),
        };
        error!(chain = %hop.chain_id, original = %hop.original_ip, at = %at, attempts, "Abandoning stalled chain");
        RetryOutcome::Abandoned(StalledChain {
            chain_id: hop.chain_id.clone(),
            original_ip: hop.original_ip.clone(),
            stuck_at: at,
            reason,
            attempts,
            stalled_at: now,
        })
    }
}
