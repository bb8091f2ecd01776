//! Task distribution: one leased task manager, a queue of board chunks and the results.
//!
//! The manager signs in for a time-limited lease, posts the chunks of a generation,
//! workers take the lowest unallocated row first and post results back, and once every
//! row of the generation has a result the board is assembled and published.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cstoken_core::records::{Board, Task, TaskManagerLease, TaskResult};
use cstoken_core::store::{Store, StoreError};
use cstoken_core::types::Timestamp;

use crate::life::{self, Chunk};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Node {0} does not hold the task manager lease")]
    LeaseNotHeld(String),
    #[error("Chunk at row {0} has no rows")]
    EmptyChunk(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Answer to a sign-in or sign-out request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseDecision {
    pub granted: bool,
    pub message: String,
    pub node_id: String,
    pub node_name: String,
}

/// The live lease, if any.
pub fn current_manager(store: &dyn Store, now: Timestamp) -> Result<Option<TaskManagerLease>, TaskError> {
    Ok(store.lease()?.filter(|l| l.is_live(now)))
}

/// Ask for the task manager role. Granted when nobody holds a live lease.
pub fn sign_in(
    store: &mut dyn Store,
    node_id: &str,
    node_name: &str,
    now: Timestamp,
    ttl: Duration,
) -> Result<LeaseDecision, TaskError> {
    let decision = |granted: bool, message: &str| LeaseDecision {
        granted,
        message: message.to_string(),
        node_id: node_id.to_string(),
        node_name: node_name.to_string(),
    };

    if let Some(lease) = current_manager(store, now)? {
        if lease.holder != node_id {
            debug!(node = node_id, holder = %lease.holder, "Task manager lease refused");
            return Ok(decision(
                false,
                "Unsuccessfully granted to become task manager. You can become a task worker.",
            ));
        }
    }

    store.put_lease(Some(TaskManagerLease {
        holder: node_id.to_string(),
        holder_name: node_name.to_string(),
        granted_at: now,
        expires_at: now + ttl,
    }))?;
    info!(node = node_id, name = node_name, "Task manager lease granted");
    Ok(decision(true, "Successfully granted to become task manager."))
}

/// Extend a live lease held by `node_id`.
pub fn renew(store: &mut dyn Store, node_id: &str, now: Timestamp, ttl: Duration) -> Result<TaskManagerLease, TaskError> {
    let mut lease = holder_lease(store, node_id, now)?;
    lease.expires_at = now + ttl;
    store.put_lease(Some(lease.clone()))?;
    debug!(node = node_id, expires_at = %lease.expires_at, "Task manager lease renewed");
    Ok(lease)
}

/// Give up the role. Only the holder of the live lease can sign out.
pub fn sign_out(store: &mut dyn Store, node_id: &str, now: Timestamp) -> Result<LeaseDecision, TaskError> {
    let held = current_manager(store, now)?.is_some_and(|l| l.holder == node_id);
    let message = if held {
        store.put_lease(None)?;
        info!(node = node_id, "Task manager signed out");
        "Successfully signed out from task manager role. Goodbye and please cleanup any task resources created."
    } else {
        "Unsuccessful sign out. You are not the current task manager."
    };
    Ok(LeaseDecision {
        granted: false,
        message: message.to_string(),
        node_id: node_id.to_string(),
        node_name: String::new(),
    })
}

fn holder_lease(store: &dyn Store, node_id: &str, now: Timestamp) -> Result<TaskManagerLease, TaskError> {
    current_manager(store, now)?
        .filter(|l| l.holder == node_id)
        .ok_or_else(|| TaskError::LeaseNotHeld(node_id.to_string()))
}

/// Queue one chunk of generation `gen_id`. Requires the live lease.
pub fn post_task(
    store: &mut dyn Store,
    node_id: &str,
    gen_id: &str,
    chunk: Chunk,
    now: Timestamp,
) -> Result<Task, TaskError> {
    holder_lease(store, node_id, now)?;
    if chunk.rows.is_empty() {
        return Err(TaskError::EmptyChunk(chunk.row));
    }
    let task = store.insert_task(Task {
        id: 0,
        gen_id: gen_id.to_string(),
        row: chunk.row,
        length: chunk.rows.len(),
        rows: chunk.rows,
        above: chunk.above,
        below: chunk.below,
        allocated: false,
    })?;
    debug!(gen = gen_id, row = task.row, length = task.length, id = task.id, "Task posted");
    Ok(task)
}

/// Split a board and queue every chunk. Requires the live lease.
pub fn post_board(
    store: &mut dyn Store,
    node_id: &str,
    gen_id: &str,
    board: &[Vec<u8>],
    chunk_rows: usize,
    now: Timestamp,
) -> Result<Vec<Task>, TaskError> {
    holder_lease(store, node_id, now)?;
    let mut tasks = Vec::new();
    for chunk in life::split_board(board, chunk_rows) {
        tasks.push(post_task(store, node_id, gen_id, chunk, now)?);
    }
    info!(gen = gen_id, tasks = tasks.len(), "Generation posted");
    Ok(tasks)
}

/// Take the unallocated task with the lowest row and mark it allocated.
pub fn next_task(store: &mut dyn Store) -> Result<Option<Task>, TaskError> {
    let candidate = store
        .tasks(None)?
        .into_iter()
        .filter(|t| !t.allocated)
        .min_by_key(|t| (t.row, t.id));
    let Some(mut task) = candidate else {
        return Ok(None);
    };
    task.allocated = true;
    store.update_task(task.clone())?;
    debug!(gen = %task.gen_id, row = task.row, id = task.id, "Task allocated");
    Ok(Some(task))
}

/// Compute the next generation of an allocated task.
pub fn compute(task: &Task) -> Vec<Vec<u8>> {
    life::step_chunk(&task.rows, task.above.as_deref(), task.below.as_deref())
}

pub fn post_result(store: &mut dyn Store, gen_id: &str, row: usize, rows: Vec<Vec<u8>>) -> Result<TaskResult, TaskError> {
    let result = store.insert_result(TaskResult {
        id: 0,
        gen_id: gen_id.to_string(),
        row,
        length: rows.len(),
        rows,
    })?;
    debug!(gen = gen_id, row, id = result.id, "Task result posted");
    Ok(result)
}

/// Results of a generation ordered by row.
pub fn results_for(store: &dyn Store, gen_id: &str) -> Result<Vec<TaskResult>, TaskError> {
    let mut results = store.results(gen_id)?;
    results.sort_by_key(|r| (r.row, r.id));
    Ok(results)
}

pub fn count_results(store: &dyn Store, gen_id: &str) -> Result<usize, TaskError> {
    Ok(store.results(gen_id)?.len())
}

/// Delete the allocated tasks and every result of a generation.
pub fn remove_completed(store: &mut dyn Store, gen_id: &str) -> Result<usize, TaskError> {
    let tasks = store.remove_tasks(gen_id, true)?;
    let results = store.remove_results(gen_id)?;
    info!(gen = gen_id, tasks, results, "Removed completed generation records");
    Ok(tasks + results)
}

/// The assembled next board, once every posted row of the generation has a result.
pub fn assemble(store: &dyn Store, gen_id: &str) -> Result<Option<Vec<Vec<u8>>>, TaskError> {
    let expected: usize = store.tasks(Some(gen_id))?.iter().map(|t| t.length).sum();
    if expected == 0 {
        return Ok(None);
    }
    let results = results_for(store, gen_id)?;
    let mut next_row = 0;
    let mut board = Vec::with_capacity(expected);
    for result in results {
        // A duplicate or gapped result means the generation is not ready.
        if result.row != next_row {
            return Ok(None);
        }
        next_row += result.length;
        board.extend(result.rows);
    }
    Ok((board.len() == expected).then_some(board))
}

/// Shape a board for publication.
pub fn publish_board(gen_id: &str, board: Vec<Vec<u8>>) -> Board {
    Board {
        gen_id: gen_id.to_string(),
        rows: board.len(),
        cols: board.first().map_or(0, Vec::len),
        board,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use cstoken_core::store::MemoryStore;

    fn t(s: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(s)
    }

    fn ttl() -> Duration {
        Duration::seconds(60)
    }

    fn glider() -> Vec<Vec<u8>> {
        vec![
            vec![0, 1, 0, 0, 0],
            vec![0, 0, 1, 0, 0],
            vec![1, 1, 1, 0, 0],
            vec![0, 0, 0, 0, 0],
            vec![0, 0, 0, 0, 0],
        ]
    }

    #[test]
    fn only_one_manager_at_a_time() {
        let mut store = MemoryStore::new();
        assert!(sign_in(&mut store, "n1", "Lemon", t(0), ttl()).unwrap().granted);
        let refused = sign_in(&mut store, "n2", "Apple", t(1), ttl()).unwrap();
        assert!(!refused.granted);
        assert!(refused.message.contains("task worker"));

        // The holder signing in again just renews.
        assert!(sign_in(&mut store, "n1", "Lemon", t(2), ttl()).unwrap().granted);
        assert_eq!(current_manager(&store, t(3)).unwrap().unwrap().expires_at, t(62));
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let mut store = MemoryStore::new();
        sign_in(&mut store, "n1", "Lemon", t(0), ttl()).unwrap();
        assert!(current_manager(&store, t(60)).unwrap().is_none());
        assert!(sign_in(&mut store, "n2", "Apple", t(60), ttl()).unwrap().granted);
        assert!(matches!(renew(&mut store, "n1", t(61), ttl()), Err(TaskError::LeaseNotHeld(_))));
    }

    #[test]
    fn only_holder_signs_out() {
        let mut store = MemoryStore::new();
        sign_in(&mut store, "n1", "Lemon", t(0), ttl()).unwrap();
        let refused = sign_out(&mut store, "n2", t(1)).unwrap();
        assert!(refused.message.starts_with("Unsuccessful"));
        assert!(current_manager(&store, t(1)).unwrap().is_some());

        let done = sign_out(&mut store, "n1", t(2)).unwrap();
        assert!(done.message.starts_with("Successfully signed out"));
        assert!(current_manager(&store, t(2)).unwrap().is_none());
    }

    #[test]
    fn posting_requires_the_lease() {
        let mut store = MemoryStore::new();
        let err = post_board(&mut store, "n1", "g1", &glider(), 2, t(0)).unwrap_err();
        assert!(matches!(err, TaskError::LeaseNotHeld(_)));
    }

    #[test]
    fn tasks_are_allocated_by_row() {
        let mut store = MemoryStore::new();
        sign_in(&mut store, "n1", "Lemon", t(0), ttl()).unwrap();
        post_task(
            &mut store,
            "n1",
            "g1",
            Chunk { row: 4, rows: vec![vec![0; 5]], above: None, below: None },
            t(1),
        )
        .unwrap();
        post_task(
            &mut store,
            "n1",
            "g1",
            Chunk { row: 0, rows: vec![vec![0; 5]], above: None, below: None },
            t(1),
        )
        .unwrap();

        assert_eq!(next_task(&mut store).unwrap().unwrap().row, 0);
        assert_eq!(next_task(&mut store).unwrap().unwrap().row, 4);
        assert!(next_task(&mut store).unwrap().is_none());
    }

    #[test]
    fn full_generation_round() {
        let mut store = MemoryStore::new();
        sign_in(&mut store, "n1", "Lemon", t(0), ttl()).unwrap();
        let board = glider();
        let posted = post_board(&mut store, "n1", "g1", &board, 2, t(1)).unwrap();
        assert_eq!(posted.len(), 3);

        while let Some(task) = next_task(&mut store).unwrap() {
            assert!(assemble(&store, "g1").unwrap().is_none());
            post_result(&mut store, &task.gen_id, task.row, compute(&task)).unwrap();
        }
        assert_eq!(count_results(&store, "g1").unwrap(), 3);

        let next = assemble(&store, "g1").unwrap().unwrap();
        assert_eq!(next, life::step_board(&board));

        let published = publish_board("g1", next);
        assert_eq!((published.rows, published.cols), (5, 5));

        assert_eq!(remove_completed(&mut store, "g1").unwrap(), 6);
        assert!(results_for(&store, "g1").unwrap().is_empty());
    }

    #[test]
    fn empty_chunk_is_rejected() {
        let mut store = MemoryStore::new();
        sign_in(&mut store, "n1", "Lemon", t(0), ttl()).unwrap();
        let err = post_task(
            &mut store,
            "n1",
            "g1",
            Chunk { row: 0, rows: vec![], above: None, below: None },
            t(1),
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::EmptyChunk(0)));
    }
}
