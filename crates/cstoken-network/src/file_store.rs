//! File-backed store: an in-memory store persisted as a JSON snapshot after every write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use cstoken_core::records::{Node, RelayLink, Task, TaskManagerLease, TaskResult, TokenGuard};
use cstoken_core::store::{MemoryStore, Store, StoreError};
use cstoken_core::types::NodeAddress;

/// Store persisted under a data directory.
///
/// Directory layout:
/// ```text
/// <data_dir>/
///   store.json       latest snapshot
///   store.json.bak   previous snapshot
///   store.json.tmp   in-flight write
/// ```
#[derive(Debug)]
pub struct FileStore {
    base_dir: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    /// Open the store under `base_dir`, creating the directory if needed. A corrupt
    /// snapshot falls back to the backup.
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create data dir: {}", base_dir.display()))?;

        let mut store = Self {
            base_dir,
            inner: MemoryStore::new(),
        };
        match read_snapshot(&store.snapshot_path()) {
            Ok(Some(snapshot)) => store.inner = snapshot,
            Ok(None) => info!(dir = %store.base_dir.display(), "Starting with an empty store"),
            Err(e) => {
                warn!(error = %e, "Snapshot unreadable, trying backup");
                store.inner = read_snapshot(&store.backup_path())
                    .context("Failed to read backup snapshot")?
                    .unwrap_or_default();
            }
        }
        Ok(store)
    }

    /// Default data directory: ~/.cstoken-node/
    pub fn default_dir() -> PathBuf {
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".cstoken-node"),
            None => PathBuf::from(".cstoken-node"),
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.base_dir.join("store.json")
    }

    pub fn backup_path(&self) -> PathBuf {
        self.base_dir.join("store.json.bak")
    }

    /// Write `snapshot` via temp file, fsync and rename. The previous snapshot is
    /// kept as the backup.
    fn persist(&self, snapshot: &MemoryStore) -> Result<(), StoreError> {
        let path = self.snapshot_path();
        let data = serde_json::to_vec_pretty(snapshot)?;

        if path.exists() {
            fs::copy(&path, self.backup_path())?;
        }

        let tmp = self.base_dir.join("store.json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        if let Ok(dir) = fs::File::open(&self.base_dir) {
            let _ = dir.sync_all();
        }

        debug!(path = %path.display(), bytes = data.len(), "Store snapshot saved");
        Ok(())
    }

    /// Apply a write to a copy and persist it. The copy replaces the in-memory state
    /// only once it is on disk, so a failed write leaves the store unchanged.
    fn write<T>(&mut self, op: impl FnOnce(&mut MemoryStore) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut next = self.inner.clone();
        let out = op(&mut next)?;
        self.persist(&next)?;
        self.inner = next;
        Ok(out)
    }
}

fn read_snapshot(path: &Path) -> Result<Option<MemoryStore>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let snapshot = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    info!(path = %path.display(), "Loaded store snapshot");
    Ok(Some(snapshot))
}

impl Store for FileStore {
    fn insert_node(&mut self, node: Node, link: RelayLink) -> Result<(), StoreError> {
        self.write(|s| s.insert_node(node, link))
    }

    fn node(&self, address: &NodeAddress) -> Result<Option<Node>, StoreError> {
        self.inner.node(address)
    }

    fn update_node(&mut self, node: Node) -> Result<(), StoreError> {
        self.write(|s| s.update_node(node))
    }

    fn nodes_in_range(&self, low: &NodeAddress, high: &NodeAddress) -> Result<Vec<Node>, StoreError> {
        self.inner.nodes_in_range(low, high)
    }

    fn node_count(&self) -> Result<usize, StoreError> {
        self.inner.node_count()
    }

    fn relay_link(&self, address: &NodeAddress) -> Result<Option<RelayLink>, StoreError> {
        self.inner.relay_link(address)
    }

    fn token_guard(&self, root: &NodeAddress) -> Result<Option<TokenGuard>, StoreError> {
        self.inner.token_guard(root)
    }

    fn put_token_guard(&mut self, guard: TokenGuard) -> Result<(), StoreError> {
        self.write(|s| s.put_token_guard(guard))
    }

    fn lease(&self) -> Result<Option<TaskManagerLease>, StoreError> {
        self.inner.lease()
    }

    fn put_lease(&mut self, lease: Option<TaskManagerLease>) -> Result<(), StoreError> {
        self.write(|s| s.put_lease(lease))
    }

    fn insert_task(&mut self, task: Task) -> Result<Task, StoreError> {
        self.write(|s| s.insert_task(task))
    }

    fn tasks(&self, gen_id: Option<&str>) -> Result<Vec<Task>, StoreError> {
        self.inner.tasks(gen_id)
    }

    fn update_task(&mut self, task: Task) -> Result<(), StoreError> {
        self.write(|s| s.update_task(task))
    }

    fn remove_tasks(&mut self, gen_id: &str, allocated_only: bool) -> Result<usize, StoreError> {
        self.write(|s| s.remove_tasks(gen_id, allocated_only))
    }

    fn insert_result(&mut self, result: TaskResult) -> Result<TaskResult, StoreError> {
        self.write(|s| s.insert_result(result))
    }

    fn results(&self, gen_id: &str) -> Result<Vec<TaskResult>, StoreError> {
        self.inner.results(gen_id)
    }

    fn remove_results(&mut self, gen_id: &str) -> Result<usize, StoreError> {
        self.write(|s| s.remove_results(gen_id))
    }
}
