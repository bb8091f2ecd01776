//! Per-runtime state and the on-disk identity seed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::RngCore;
use tracing::info;

use cstoken_core::store::Store;
use cstoken_core::types::{constants, NodeAddress};
use cstoken_network::transport::DedupCache;
use cstoken_protocol::chains::{ChainTracker, StallTracker};
use cstoken_protocol::connectivity::DeferredUpdates;

use crate::config::NodeConfig;

/// Everything one runtime owns: its store plus the chain bookkeeping kept in memory.
pub struct NodeState<S: Store> {
    pub store: S,
    pub node_id: String,
    pub served: BTreeSet<NodeAddress>,
    pub worker: bool,
    pub lease_ttl: chrono::Duration,
    pub chunk_rows: usize,
    /// Chains this runtime submitted and is waiting on.
    pub chains: ChainTracker,
    /// Hops this runtime could not relay yet.
    pub stalls: StallTracker,
    /// Replicated updates waiting for their node's registration.
    pub deferred: DeferredUpdates,
    pub dedup: DedupCache,
}

impl<S: Store> NodeState<S> {
    pub fn new(store: S, config: &NodeConfig) -> Self {
        Self {
            store,
            node_id: config.node_id.clone(),
            served: config.served.clone(),
            worker: config.worker,
            lease_ttl: config.lease_ttl,
            chunk_rows: config.chunk_rows,
            chains: ChainTracker::new(config.chain_deadline, config.max_resubmits),
            stalls: StallTracker::new(config.max_relay_retries),
            deferred: DeferredUpdates::new(constants::MAX_DEFERRED_UPDATES),
            dedup: DedupCache::new(config.dedup_capacity),
        }
    }

    /// Whether hops sourced at `address` (and releases of its token) are processed here.
    pub fn serves(&self, address: &NodeAddress) -> bool {
        self.served.is_empty() || self.served.contains(address)
    }
}

/// Path of the libp2p identity seed under a data directory.
pub fn identity_path(data_dir: &Path) -> PathBuf {
    data_dir.join("identity.key")
}

/// Load the 32-byte identity seed, or generate and save one (mode 0600).
///
/// Refuses a seed file readable by group or others.
pub fn load_or_create_seed(data_dir: &Path) -> Result<[u8; 32]> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;
    let path = identity_path(data_dir);

    if path.exists() {
        check_permissions(&path)?;
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read identity from {}", path.display()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Identity file must be exactly 32 bytes"))?;
        info!(path = %path.display(), "Loaded identity seed");
        return Ok(seed);
    }

    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    std::fs::write(&path, seed)
        .with_context(|| format!("Failed to write identity to {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    info!(path = %path.display(), "Generated identity seed (mode 0600)");
    Ok(seed)
}

fn check_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            anyhow::bail!(
                "Identity key file {} has insecure permissions {:04o}. Fix with: chmod 600 {}",
                path.display(),
                mode,
                path.display()
            );
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cstoken_core::store::MemoryStore;
    use tempfile::TempDir;

    #[test]
    fn coordinator_serves_everything() {
        let state = NodeState::new(MemoryStore::new(), &NodeConfig::default());
        assert!(state.serves(&"5010".into()));
        assert!(state.serves(&"anything".into()));
    }

    #[test]
    fn served_set_limits_processing() {
        let config = NodeConfig {
            served: [NodeAddress::from("5010"), NodeAddress::from("5020")].into_iter().collect(),
            ..NodeConfig::default()
        };
        let state = NodeState::new(MemoryStore::new(), &config);
        assert!(state.serves(&"5020".into()));
        assert!(!state.serves(&"5080".into()));
    }

    #[test]
    fn seed_is_created_once_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let first = load_or_create_seed(dir.path()).unwrap();
        let second = load_or_create_seed(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn seed_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        load_or_create_seed(dir.path()).unwrap();
        let mode = std::fs::metadata(identity_path(dir.path())).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_seed_is_refused() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = identity_path(dir.path());
        std::fs::write(&path, [9u8; 32]).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(load_or_create_seed(dir.path()).is_err());
    }

    #[test]
    fn short_seed_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = identity_path(dir.path());
        std::fs::write(&path, [1u8; 5]).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        assert!(load_or_create_seed(dir.path()).is_err());
    }
}
