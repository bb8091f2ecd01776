//! Persistence seam: node records, relay links, token guards, the task-manager lease,
//! tasks and results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::records::{Node, RelayLink, Task, TaskManagerLease, TaskResult, TokenGuard};
use crate::types::NodeAddress;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record already exists: {0}")]
    Conflict(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Synchronous record store. Each runtime owns exactly one.
pub trait Store: Send {
    /// Create a node together with its relay link. `Conflict` if the address exists.
    fn insert_node(&mut self, node: Node, link: RelayLink) -> Result<(), StoreError>;
    fn node(&self, address: &NodeAddress) -> Result<Option<Node>, StoreError>;
    /// Replace an existing node. `NotFound` if it was never inserted.
    fn update_node(&mut self, node: Node) -> Result<(), StoreError>;
    /// Nodes with `low <= address <= high`, ascending by address.
    fn nodes_in_range(&self, low: &NodeAddress, high: &NodeAddress) -> Result<Vec<Node>, StoreError>;
    fn node_count(&self) -> Result<usize, StoreError>;
    fn relay_link(&self, address: &NodeAddress) -> Result<Option<RelayLink>, StoreError>;

    fn token_guard(&self, root: &NodeAddress) -> Result<Option<TokenGuard>, StoreError>;
    fn put_token_guard(&mut self, guard: TokenGuard) -> Result<(), StoreError>;

    fn lease(&self) -> Result<Option<TaskManagerLease>, StoreError>;
    fn put_lease(&mut self, lease: Option<TaskManagerLease>) -> Result<(), StoreError>;

    /// Store a task, assigning it the next id. The stored task is returned.
    fn insert_task(&mut self, task: Task) -> Result<Task, StoreError>;
    fn tasks(&self, gen_id: Option<&str>) -> Result<Vec<Task>, StoreError>;
    fn update_task(&mut self, task: Task) -> Result<(), StoreError>;
    /// Remove tasks of a generation, optionally only the allocated ones.
    fn remove_tasks(&mut self, gen_id: &str, allocated_only: bool) -> Result<usize, StoreError>;

    fn insert_result(&mut self, result: TaskResult) -> Result<TaskResult, StoreError>;
    fn results(&self, gen_id: &str) -> Result<Vec<TaskResult>, StoreError>;
    fn remove_results(&mut self, gen_id: &str) -> Result<usize, StoreError>;
}

/// In-memory store. Also the snapshot format of the file store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStore {
    nodes: BTreeMap<NodeAddress, Node>,
    links: BTreeMap<NodeAddress, RelayLink>,
    guards: BTreeMap<NodeAddress, TokenGuard>,
    lease: Option<TaskManagerLease>,
    tasks: BTreeMap<u64, Task>,
    results: BTreeMap<u64, TaskResult>,
    next_task_id: u64,
    next_result_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_node(&mut self, node: Node, link: RelayLink) -> Result<(), StoreError> {
        if self.nodes.contains_key(&node.address) {
            return Err(StoreError::Conflict(node.address.to_string()));
        }
        self.links.insert(link.node.clone(), link);
        self.nodes.insert(node.address.clone(), node);
        Ok(())
    }

    fn node(&self, address: &NodeAddress) -> Result<Option<Node>, StoreError> {
        Ok(self.nodes.get(address).cloned())
    }

    fn update_node(&mut self, node: Node) -> Result<(), StoreError> {
        match self.nodes.get_mut(&node.address) {
            Some(slot) => {
                *slot = node;
                Ok(())
            }
            None => Err(StoreError::NotFound(node.address.to_string())),
        }
    }

    fn nodes_in_range(&self, low: &NodeAddress, high: &NodeAddress) -> Result<Vec<Node>, StoreError> {
        if low > high {
            return Ok(Vec::new());
        }
        Ok(self
            .nodes
            .range(low.clone()..=high.clone())
            .map(|(_, node)| node.clone())
            .collect())
    }

    fn node_count(&self) -> Result<usize, StoreError> {
        Ok(self.nodes.len())
    }

    fn relay_link(&self, address: &NodeAddress) -> Result<Option<RelayLink>, StoreError> {
        Ok(self.links.get(address).cloned())
    }

    fn token_guard(&self, root: &NodeAddress) -> Result<Option<TokenGuard>, StoreError> {
        Ok(self.guards.get(root).cloned())
    }

    fn put_token_guard(&mut self, guard: TokenGuard) -> Result<(), StoreError> {
        self.guards.insert(guard.root.clone(), guard);
        Ok(())
    }

    fn lease(&self) -> Result<Option<TaskManagerLease>, StoreError> {
        Ok(self.lease.clone())
    }

    fn put_lease(&mut self, lease: Option<TaskManagerLease>) -> Result<(), StoreError> {
        self.lease = lease;
        Ok(())
    }

    fn insert_task(&mut self, mut task: Task) -> Result<Task, StoreError> {
        self.next_task_id += 1;
        task.id = self.next_task_id;
        self.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn tasks(&self, gen_id: Option<&str>) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .values()
            .filter(|t| gen_id.is_none_or(|g| t.gen_id == g))
            .cloned()
            .collect())
    }

    fn update_task(&mut self, task: Task) -> Result<(), StoreError> {
        match self.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("task {}", task.id))),
        }
    }

    fn remove_tasks(&mut self, gen_id: &str, allocated_only: bool) -> Result<usize, StoreError> {
        let before = self.tasks.len();
        self.tasks
            .retain(|_, t| !(t.gen_id == gen_id && (t.allocated || !allocated_only)));
        Ok(before - self.tasks.len())
    }

    fn insert_result(&mut self, mut result: TaskResult) -> Result<TaskResult, StoreError> {
        self.next_result_id += 1;
        result.id = self.next_result_id;
        self.results.insert(result.id, result.clone());
        Ok(result)
    }

    fn results(&self, gen_id: &str) -> Result<Vec<TaskResult>, StoreError> {
        Ok(self
            .results
            .values()
            .filter(|r| r.gen_id == gen_id)
            .cloned()
            .collect())
    }

    fn remove_results(&mut self, gen_id: &str) -> Result<usize, StoreError> {
        let before = self.results.len();
        self.results.retain(|_, r| r.gen_id != gen_id);
        Ok(before - self.results.len())
    }
}
