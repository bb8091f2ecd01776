//! In-process event bus over tokio channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use cstoken_core::event::Topic;

use crate::bus::{BusError, EventBus, Subscribers, Subscription};

/// Bus shared by every runtime in one process. Clones publish to the same subscribers.
///
/// Every subscriber of a topic receives every publish, the publisher included, in
/// publish order.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    subscribers: Subscribers,
    offline: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publishes fail with `BrokerUnavailable` until brought back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl EventBus for MemoryBus {
    async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BusError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::BrokerUnavailable("memory bus offline".into()));
        }
        let receivers = self.subscribers.deliver(topic, &payload);
        trace!(topic = %topic, receivers, bytes = payload.len(), "Published");
        Ok(())
    }

    fn subscribe(&self, topics: &[Topic]) -> Result<Subscription, BusError> {
        self.subscribers.add(topics)
    }
}
