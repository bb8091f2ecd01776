//! Event bus capability: publish bytes on a topic, subscribe to a set of topics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use cstoken_core::constants;
use cstoken_core::event::Topic;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The transport cannot take the message right now. Retryable.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),
    /// The transport refused this message; retrying will not help.
    #[error("Message rejected: {0}")]
    Rejected(String),
    /// The transport is gone for good.
    #[error("Bus closed")]
    Closed,
}

impl BusError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::BrokerUnavailable(_))
    }
}

/// One message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: Topic,
    pub payload: Vec<u8>,
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Next delivery, or `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

/// Transport-neutral publish/subscribe.
///
/// Delivery is at least once and ordered per publisher; consumers deduplicate by
/// envelope id.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: Topic, payload: Vec<u8>) -> impl Future<Output = Result<(), BusError>> + Send;

    fn subscribe(&self, topics: &[Topic]) -> Result<Subscription, BusError>;
}

/// Local fan-out table shared by every bus implementation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Subscribers {
    inner: Arc<Mutex<HashMap<Topic, Vec<mpsc::UnboundedSender<Delivery>>>>>,
}

impl Subscribers {
    pub(crate) fn add(&self, topics: &[Topic]) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.inner.lock().map_err(|_| BusError::Closed)?;
        for topic in topics {
            table.entry(*topic).or_default().push(tx.clone());
        }
        Ok(Subscription { rx })
    }

    /// Hand a payload to every live subscriber of `topic`. Returns how many got it.
    pub(crate) fn deliver(&self, topic: Topic, payload: &[u8]) -> usize {
        let Ok(mut table) = self.inner.lock() else {
            return 0;
        };
        let Some(senders) = table.get_mut(&topic) else {
            return 0;
        };
        senders.retain(|tx| {
            tx.send(Delivery {
                topic,
                payload: payload.to_vec(),
            })
            .is_ok()
        });
        senders.len()
    }
}

/// Exponential backoff for retryable publish failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::PUBLISH_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(constants::PUBLISH_INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(constants::PUBLISH_MAX_BACKOFF_MS),
        }
    }
}

/// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, capped,
/// plus a deterministic jitter of up to a quarter of the base.
pub fn compute_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay.as_millis() as u64;
    let max = config.max_delay.as_millis() as u64;
    let exponent = attempt.saturating_sub(1).min(32);
    let base = initial.saturating_mul(1u64 << exponent).min(max);

    let quarter = base / 4;
    let jitter = if quarter > 0 {
        (attempt as u64).wrapping_mul(7919).wrapping_add(104_729) % (quarter + 1)
    } else {
        0
    };
    Duration::from_millis(base.saturating_add(jitter).min(max))
}

/// Publish, retrying `BrokerUnavailable` with exponential backoff.
pub async fn publish_with_backoff<B: EventBus>(
    bus: &B,
    topic: Topic,
    payload: Vec<u8>,
    config: &BackoffConfig,
) -> Result<(), BusError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match bus.publish(topic, payload.clone()).await {
            Ok(()) => {
                if attempt > 1 {
                    debug!(topic = %topic, attempt, "Published after retry");
                }
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = compute_delay(config, attempt);
                warn!(topic = %topic, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Publish failed, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
