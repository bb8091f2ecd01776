//! Event loop tying a [`NodeState`] to an [`EventBus`].

use std::future::Future;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cstoken_core::event::{EventEnvelope, Topic};
use cstoken_core::store::Store;
use cstoken_core::types::{self, Timestamp};
use cstoken_network::bus::{publish_with_backoff, BackoffConfig, BusError, Delivery, EventBus, Subscription};

use crate::command::{Command, CommandError};
use crate::handler::{self, HandlerResponse};
use crate::state::NodeState;

/// One node runtime: owns its state and a subscription to every event topic.
///
/// Everything the runtime publishes comes back through its own subscription and is
/// handled like any other delivery; the envelope id keeps redeliveries out.
pub struct Runtime<S: Store, B: EventBus> {
    state: NodeState<S>,
    bus: B,
    subscription: Subscription,
    backoff: BackoffConfig,
    tick: std::time::Duration,
}

impl<S: Store, B: EventBus> Runtime<S, B> {
    pub fn new(
        state: NodeState<S>,
        bus: B,
        backoff: BackoffConfig,
        tick: std::time::Duration,
    ) -> Result<Self, BusError> {
        let subscription = bus.subscribe(&Topic::ALL)?;
        Ok(Self {
            state,
            bus,
            subscription,
            backoff,
            tick,
        })
    }

    pub fn state(&self) -> &NodeState<S> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut NodeState<S> {
        &mut self.state
    }

    pub fn into_state(self) -> NodeState<S> {
        self.state
    }

    /// Run an operator command and publish what it produced.
    pub async fn execute(&mut self, command: Command, now: Timestamp) -> Result<(), CommandError> {
        let responses = handler::handle_command(&mut self.state, command, now)?;
        self.dispatch(responses, now).await;
        Ok(())
    }

    /// Handle one delivery from the bus.
    pub async fn deliver(&mut self, delivery: Delivery, now: Timestamp) {
        let envelope = match EventEnvelope::decode(delivery.topic, &delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %delivery.topic, error = %e, "Dropping undecodable envelope");
                return;
            }
        };
        let responses = handler::handle_envelope(&mut self.state, &envelope, now);
        self.dispatch(responses, now).await;
    }

    /// One maintenance pass.
    pub async fn tick(&mut self, now: Timestamp) {
        let responses = handler::on_tick(&mut self.state, now);
        self.dispatch(responses, now).await;
    }

    /// Handle every delivery already queued, including the ones that handling
    /// produces, until the subscription is empty. Returns how many were handled.
    pub async fn drain(&mut self, now: Timestamp) -> usize {
        let mut handled = 0;
        while let Some(delivery) = self.subscription.try_recv() {
            self.deliver(delivery, now).await;
            handled += 1;
        }
        handled
    }

    async fn dispatch(&mut self, responses: Vec<HandlerResponse>, now: Timestamp) {
        for response in responses {
            let HandlerResponse::Publish(event) = response;
            let topic = event.topic();
            let bytes = match EventEnvelope::seal(self.state.node_id.clone(), event, now).and_then(|e| e.to_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(topic = %topic, error = %e, "Failed to encode event");
                    continue;
                }
            };
            if let Err(e) = publish_with_backoff(&self.bus, topic, bytes, &self.backoff).await {
                error!(topic = %topic, error = %e, "Publish failed, event dropped");
            }
        }
    }

    /// Main loop. Stops when `shutdown` resolves or the bus closes, and hands the
    /// state back.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: impl Future<Output = ()>,
    ) -> NodeState<S> {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        let mut commands_open = true;

        info!(node_id = %self.state.node_id, served = self.state.served.len(), worker = self.state.worker, "Runtime started");
        loop {
            tokio::select! {
                delivery = self.subscription.recv() => match delivery {
                    Some(delivery) => self.deliver(delivery, types::now()).await,
                    None => {
                        warn!("Bus closed, stopping runtime");
                        break;
                    }
                },

                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => {
                        debug!(command = ?cmd, "Executing command");
                        if let Err(e) = self.execute(cmd, types::now()).await {
                            warn!(error = %e, "Command failed");
                        }
                    }
                    None => commands_open = false,
                },

                _ = tick.tick() => self.tick(types::now()).await,

                _ = &mut shutdown => {
                    info!("Shutting down runtime");
                    break;
                }
            }
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cstoken_core::event::Event;
    use cstoken_core::store::MemoryStore;
    use cstoken_network::memory_bus::MemoryBus;

    use crate::config::NodeConfig;

    fn runtime(bus: &MemoryBus) -> Runtime<MemoryStore, MemoryBus> {
        let config = NodeConfig::default();
        Runtime::new(
            NodeState::new(MemoryStore::new(), &config),
            bus.clone(),
            config.backoff.clone(),
            Duration::from_millis(10),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn own_publishes_are_handled_once() {
        let bus = MemoryBus::new();
        let mut rt = runtime(&bus);
        let now = types::now();
        rt.execute(
            Command::Register { address: "5010".into(), name: "Lemon".into(), parent: None },
            now,
        )
        .await
        .unwrap();
        assert_eq!(rt.drain(now).await, 1);
        assert_eq!(rt.drain(now).await, 0);
        assert_eq!(rt.state().dedup.len(), 1);
    }

    #[tokio::test]
    async fn undecodable_payloads_are_dropped() {
        let bus = MemoryBus::new();
        let mut rt = runtime(&bus);
        bus.publish(Topic::CsRequestCreated, b"not json".to_vec()).await.unwrap();
        assert_eq!(rt.drain(types::now()).await, 1);
        assert!(rt.state().dedup.is_empty());
    }

    #[tokio::test]
    async fn run_executes_commands_until_shutdown() {
        let bus = MemoryBus::new();
        let mut observer = bus.subscribe(&[Topic::NodeConnected]).unwrap();
        let rt = runtime(&bus);

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(rt.run(rx, async move {
            let _ = stop_rx.await;
        }));

        tx.send(Command::Register { address: "5010".into(), name: "Lemon".into(), parent: None }).unwrap();
        tx.send(Command::Connect { address: "5010".into(), process_id: "p1".into() }).unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(5), observer.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope = EventEnvelope::decode(delivery.topic, &delivery.payload).unwrap();
        assert!(matches!(envelope.event, Event::Connected(ref c) if c.process_id == "p1"));

        stop_tx.send(()).unwrap();
        let state = handle.await.unwrap();
        let node = state.store.node(&"5010".into()).unwrap().unwrap();
        assert!(node.connected);
    }
}
