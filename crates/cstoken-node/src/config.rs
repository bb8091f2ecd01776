//! Runtime configuration.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use cstoken_core::constants;
use cstoken_core::types::NodeAddress;
use cstoken_network::bus::BackoffConfig;
use cstoken_network::file_store::FileStore;

/// Node runtime configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the store snapshot and the identity seed.
    pub data_dir: PathBuf,
    /// Identity written into every envelope this runtime emits.
    pub node_id: String,
    /// Addresses whose hops and releases this runtime processes. Empty means all of them.
    pub served: BTreeSet<NodeAddress>,
    /// Take and compute Game of Life tasks on every tick.
    pub worker: bool,
    pub tick: Duration,
    pub chain_deadline: chrono::Duration,
    pub max_resubmits: u32,
    pub max_relay_retries: u32,
    pub lease_ttl: chrono::Duration,
    pub chunk_rows: usize,
    pub dedup_capacity: usize,
    pub backoff: BackoffConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: FileStore::default_dir(),
            node_id: "cstoken-node".to_string(),
            served: BTreeSet::new(),
            worker: false,
            tick: Duration::from_millis(constants::MAINTENANCE_TICK_MS),
            chain_deadline: chrono::Duration::milliseconds(constants::CHAIN_DEADLINE_MS),
            max_resubmits: constants::MAX_RESUBMITS,
            max_relay_retries: constants::MAX_RELAY_RETRIES,
            lease_ttl: chrono::Duration::milliseconds(constants::TASK_MANAGER_LEASE_MS),
            chunk_rows: constants::DEFAULT_CHUNK_ROWS,
            dedup_capacity: constants::DEDUP_CACHE_SIZE,
            backoff: BackoffConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Coordinator mode: every hop and release is processed here.
    pub fn is_coordinator(&self) -> bool {
        self.served.is_empty()
    }
}
