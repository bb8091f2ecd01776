//! Core types for the cstoken protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Network address of a node (e.g. `"5010"`). Ordering is lexicographic on the string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies one logical request across every hop of its relay chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    /// Derive the chain id from the originator and the submission instant.
    ///
    /// Truncated SHA-256 over `original_ip || 0x00 || rfc3339(submitted_at)`.
    pub fn derive(original_ip: &NodeAddress, submitted_at: Timestamp) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(original_ip.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(
            submitted_at
                .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Wall-clock instant, serialized as RFC 3339.
pub type Timestamp = DateTime<Utc>;

/// Envelope id: SHA-256 hex digest of the canonical body.
pub type EventId = String;

/// Current wall-clock time.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Protocol constants.
pub mod constants {
    /// Envelope format version.
    pub const PROTOCOL_VERSION: u32 = 1;

    // Delivery
    pub const DEDUP_CACHE_SIZE: usize = 10_000;
    /// Replicated updates held back until their node is registered.
    pub const MAX_DEFERRED_UPDATES: usize = 1_024;
    pub const PUBLISH_MAX_ATTEMPTS: u32 = 5;
    pub const PUBLISH_INITIAL_BACKOFF_MS: u64 = 100;
    pub const PUBLISH_MAX_BACKOFF_MS: u64 = 5_000;

    // Chains
    pub const CHAIN_DEADLINE_MS: i64 = 30_000;
    pub const MAX_RESUBMITS: u32 = 2;
    pub const MAX_RELAY_RETRIES: u32 = 3;
    pub const MAINTENANCE_TICK_MS: u64 = 1_000;

    // Task distribution
    pub const TASK_MANAGER_LEASE_MS: i64 = 60_000;
    pub const DEFAULT_CHUNK_ROWS: usize = 8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn addresses_order_lexicographically() {
        let mut addrs: Vec<NodeAddress> = ["5080", "5010", "5030"].into_iter().map(Into::into).collect();
        addrs.sort();
        let sorted: Vec<&str> = addrs.iter().map(NodeAddress::as_str).collect();
        assert_eq!(sorted, vec!["5010", "5030", "5080"]);
    }

    #[test]
    fn address_serializes_as_plain_string() {
        let json = serde_json::to_string(&NodeAddress::from("5010")).unwrap();
        assert_eq!(json, "\"5010\"");
    }

    #[test]
    fn chain_id_is_deterministic_and_distinct() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = ChainId::derive(&"5080".into(), t);
        let b = ChainId::derive(&"5080".into(), t);
        let c = ChainId::derive(&"5070".into(), t);
        let d = ChainId::derive(&"5080".into(), t + chrono::Duration::milliseconds(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.as_str().len(), 32);
    }
}
