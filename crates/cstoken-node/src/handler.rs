//! Event dispatcher: routes received envelopes, operator commands and maintenance ticks
//! to the protocol, and collects the events to publish in return.

use tracing::{debug, error, info, warn};

use cstoken_core::event::{Event, EventEnvelope};
use cstoken_core::records::{CsAcquire, CsRelease, CsRequestHop, RegisteredNode, Reparented, StalledChain};
use cstoken_core::store::Store;
use cstoken_core::types::Timestamp;
use cstoken_protocol::chains::{DeadlineAction, RetryOutcome};
use cstoken_protocol::connectivity::ReplicatedUpdate;
use cstoken_protocol::mutex::{self, HopOutcome};
use cstoken_protocol::{connectivity, registry, tasks};

use crate::command::{Command, CommandError};
use crate::state::NodeState;

/// Action queued by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResponse {
    /// Publish this event on its topic.
    Publish(Event),
}

fn publish(event: Event) -> HandlerResponse {
    HandlerResponse::Publish(event)
}

/// Dispatch a received envelope. Envelopes already seen are dropped.
pub fn handle_envelope<S: Store>(
    state: &mut NodeState<S>,
    envelope: &EventEnvelope,
    now: Timestamp,
) -> Vec<HandlerResponse> {
    if state.dedup.check_and_insert(&envelope.id) {
        debug!(id = %envelope.id, chain = ?envelope.event.chain_id(), "Duplicate envelope");
        return Vec::new();
    }

    let mut responses = Vec::new();
    match &envelope.event {
        Event::Registered(registered) => handle_registered(state, registered),
        Event::Reparented(reparented) => {
            replicate(state, ReplicatedUpdate::Reparented(reparented.clone()));
        }
        Event::Connected(connected) => {
            replicate(state, ReplicatedUpdate::Connected(connected.clone()));
        }
        Event::Disconnected(disconnected) => {
            replicate(state, ReplicatedUpdate::Disconnected(disconnected.clone()));
        }
        Event::RequestHop(hop) => responses.extend(handle_hop(state, hop, now)),
        Event::Acquired(acquire) => handle_acquired(state, acquire),
        Event::Released(release) => responses.extend(handle_release(state, release)),
        Event::ChainStalled(stalled) => handle_chain_stalled(state, stalled),
        Event::TaskPosted(task) => {
            debug!(gen = %task.gen_id, row = task.row, from = %envelope.from, "Task posted");
        }
        Event::TaskResultPosted(result) => {
            debug!(gen = %result.gen_id, row = result.row, from = %envelope.from, "Task result posted");
        }
        Event::BoardPublished(board) => {
            info!(gen = %board.gen_id, rows = board.rows, cols = board.cols, from = %envelope.from, "Board published");
        }
    }
    responses
}

fn handle_registered<S: Store>(state: &mut NodeState<S>, registered: &RegisteredNode) {
    match registry::apply_registered(&mut state.store, registered) {
        Ok(true) => {
            let replayed = state.deferred.replay(&mut state.store);
            debug!(node = %registered.node.address, replayed, "Registered replicated node");
        }
        Ok(false) => {}
        Err(e) => warn!(node = %registered.node.address, error = %e, "Could not apply registration"),
    }
}

fn replicate<S: Store>(state: &mut NodeState<S>, update: ReplicatedUpdate) {
    if let Err(e) = state.deferred.apply_or_defer(&mut state.store, update.clone()) {
        warn!(update = ?update, error = %e, "Could not apply replicated update");
    }
}

/// Move one hop if this runtime serves its source. Failures never reach the
/// originator as errors: they are logged and published as a stalled chain.
fn handle_hop<S: Store>(state: &mut NodeState<S>, hop: &CsRequestHop, now: Timestamp) -> Vec<HandlerResponse> {
    state.chains.observe_hop(hop, now);
    if !state.serves(&hop.source_ip) {
        return Vec::new();
    }

    match mutex::handle_hop(&mut state.store, hop, now) {
        Ok(HopOutcome::Forwarded(next)) => vec![publish(Event::RequestHop(next))],
        Ok(HopOutcome::Granted(acquire)) => vec![publish(Event::Acquired(acquire))],
        Ok(HopOutcome::Queued { root, position }) => {
            debug!(chain = %hop.chain_id, root = %root, position, "Chain queued at root");
            Vec::new()
        }
        Ok(HopOutcome::Duplicate { .. }) => Vec::new(),
        Ok(HopOutcome::Stalled(stalled)) => {
            let attempts = state.stalls.record(&stalled);
            debug!(chain = %hop.chain_id, attempts, "Hop parked for retry");
            Vec::new()
        }
        Err(e) => {
            error!(chain = %hop.chain_id, at = %hop.source_ip, error = %e, "Relay failed");
            vec![publish(Event::ChainStalled(StalledChain {
                chain_id: hop.chain_id.clone(),
                original_ip: hop.original_ip.clone(),
                stuck_at: hop.source_ip.clone(),
                reason: e.to_string(),
                attempts: 0,
                stalled_at: now,
            }))]
        }
    }
}

fn handle_acquired<S: Store>(state: &mut NodeState<S>, acquire: &CsAcquire) {
    state.chains.observe_acquired(acquire);
    if state.serves(&acquire.source_ip) {
        info!(root = %acquire.ip, holder = %acquire.source_ip, chain = %acquire.chain_id, "Token acquired");
    }
}

fn handle_release<S: Store>(state: &mut NodeState<S>, release: &CsRelease) -> Vec<HandlerResponse> {
    if !state.serves(&release.ip) {
        return Vec::new();
    }
    match mutex::release(&mut state.store, release) {
        Ok(Some(next)) => vec![publish(Event::Acquired(next))],
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!(root = %release.ip, holder = %release.source_ip, error = %e, "Release refused");
            Vec::new()
        }
    }
}

fn handle_chain_stalled<S: Store>(state: &mut NodeState<S>, stalled: &StalledChain) {
    state.stalls.clear(&stalled.chain_id);
    if state.chains.observe_stalled(&stalled.chain_id) || state.serves(&stalled.original_ip) {
        error!(
            chain = %stalled.chain_id,
            original = %stalled.original_ip,
            at = %stalled.stuck_at,
            reason = %stalled.reason,
            "Request chain failed"
        );
    }
}

/// Execute an operator command.
pub fn handle_command<S: Store>(
    state: &mut NodeState<S>,
    command: Command,
    now: Timestamp,
) -> Result<Vec<HandlerResponse>, CommandError> {
    let store = &mut state.store;
    let responses = match command {
        Command::Register { address, name, parent } => {
            let node = match parent {
                Some(parent) => registry::register_under(store, address, &name, parent)?,
                None => registry::register(store, address, &name)?,
            };
            let link = registry::relay_link(store, &node.address)?;
            state.deferred.replay(store);
            vec![publish(Event::Registered(RegisteredNode {
                node,
                static_parent: link.static_parent,
            }))]
        }
        Command::Connect { address, process_id } => {
            let connected = connectivity::connect(store, &address, &process_id, now)?;
            vec![publish(Event::Connected(connected))]
        }
        Command::Disconnect { address } => {
            let disconnected = connectivity::disconnect(store, &address, now)?;
            vec![publish(Event::Disconnected(disconnected))]
        }
        Command::Reparent { address, parent } => {
            connectivity::reparent(store, &address, &parent)?;
            vec![publish(Event::Reparented(Reparented {
                source_ip: address,
                parent_ip: parent,
            }))]
        }
        Command::Request { address } => {
            let hop = mutex::submit(store, &address, now)?;
            state.chains.track(&hop, 0);
            vec![publish(Event::RequestHop(hop))]
        }
        Command::Release { root, holder } => {
            vec![publish(Event::Released(mutex::release_record(&root, &holder, now)))]
        }
        Command::SignIn { name } => {
            let decision = tasks::sign_in(store, &state.node_id, &name, now, state.lease_ttl)?;
            info!(granted = decision.granted, message = %decision.message, "Task manager sign-in");
            if !decision.granted {
                return Err(CommandError::LeaseHeld(decision.message));
            }
            Vec::new()
        }
        Command::SignOut => {
            let decision = tasks::sign_out(store, &state.node_id, now)?;
            info!(message = %decision.message, "Task manager sign-out");
            Vec::new()
        }
        Command::PostBoard { gen_id, board } => {
            let posted = tasks::post_board(store, &state.node_id, &gen_id, &board, state.chunk_rows, now)?;
            posted.into_iter().map(|t| publish(Event::TaskPosted(t))).collect()
        }
    };
    Ok(responses)
}

/// Periodic maintenance: chain deadlines, stalled hop retries, lease renewal and
/// worker computation.
pub fn on_tick<S: Store>(state: &mut NodeState<S>, now: Timestamp) -> Vec<HandlerResponse> {
    let mut responses = Vec::new();

    for action in state.chains.expire(now) {
        match action {
            DeadlineAction::Resubmit { original_ip, resubmits } => {
                match mutex::submit(&state.store, &original_ip, now) {
                    Ok(hop) => {
                        state.chains.track(&hop, resubmits);
                        responses.push(publish(Event::RequestHop(hop)));
                    }
                    Err(e) => error!(original = %original_ip, error = %e, "Resubmit failed"),
                }
            }
            DeadlineAction::Abandon { chain_id, original_ip } => {
                error!(chain = %chain_id, original = %original_ip, "Request dropped after deadline");
            }
        }
    }

    for outcome in state.stalls.retry(&mut state.store, now) {
        match outcome {
            RetryOutcome::Forwarded(hop) | RetryOutcome::Shortcut(hop) => {
                responses.push(publish(Event::RequestHop(hop)));
            }
            RetryOutcome::Granted(acquire) => responses.push(publish(Event::Acquired(acquire))),
            RetryOutcome::Abandoned(stalled) => responses.push(publish(Event::ChainStalled(stalled))),
            RetryOutcome::Settled(_) | RetryOutcome::StillStalled { .. } => {}
        }
    }

    renew_lease(state, now);
    if state.worker {
        responses.extend(work_one_task(state));
    }
    responses
}

fn renew_lease<S: Store>(state: &mut NodeState<S>, now: Timestamp) {
    let held = match tasks::current_manager(&state.store, now) {
        Ok(lease) => lease.is_some_and(|l| l.holder == state.node_id),
        Err(e) => {
            warn!(error = %e, "Could not read task manager lease");
            false
        }
    };
    if held {
        if let Err(e) = tasks::renew(&mut state.store, &state.node_id, now, state.lease_ttl) {
            warn!(error = %e, "Task manager lease renewal failed");
        }
    }
}

/// Take one task, compute it and post the result. Publishes the board when the
/// generation is complete.
fn work_one_task<S: Store>(state: &mut NodeState<S>) -> Vec<HandlerResponse> {
    let store = &mut state.store;
    let task = match tasks::next_task(store) {
        Ok(Some(task)) => task,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(error = %e, "Could not take a task");
            return Vec::new();
        }
    };

    let rows = tasks::compute(&task);
    let result = match tasks::post_result(store, &task.gen_id, task.row, rows) {
        Ok(result) => result,
        Err(e) => {
            warn!(gen = %task.gen_id, row = task.row, error = %e, "Could not post result");
            return Vec::new();
        }
    };
    let mut responses = vec![publish(Event::TaskResultPosted(result))];

    match tasks::assemble(store, &task.gen_id) {
        Ok(Some(board)) => {
            let board = tasks::publish_board(&task.gen_id, board);
            if let Err(e) = tasks::remove_completed(store, &task.gen_id) {
                warn!(gen = %task.gen_id, error = %e, "Could not clean up generation");
            }
            responses.push(publish(Event::BoardPublished(board)));
        }
        Ok(None) => {}
        Err(e) => warn!(gen = %task.gen_id, error = %e, "Could not assemble board"),
    }
    responses
}
