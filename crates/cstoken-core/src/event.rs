//! Event kinds, bus topics and the envelope carried on the wire.

use serde::{Deserialize, Serialize};

use crate::canonical::content_id;
use crate::records::{
    Board, ConnectedClient, CsAcquire, CsRelease, CsRequestHop, DisconnectedClient,
    RegisteredNode, Reparented, StalledChain, Task, TaskResult,
};
use crate::types::{constants, ChainId, EventId, Timestamp};

/// Bus topics. Each event kind is published on exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    NodeRegistered,
    NodeReparented,
    NodeConnected,
    NodeDisconnected,
    CsRequestCreated,
    CsAcquireCreated,
    CsReleaseCreated,
    CsChainStalled,
    TaskPosted,
    TaskResultPosted,
    BoardPublished,
}

impl Topic {
    pub const ALL: [Topic; 11] = [
        Topic::NodeRegistered,
        Topic::NodeReparented,
        Topic::NodeConnected,
        Topic::NodeDisconnected,
        Topic::CsRequestCreated,
        Topic::CsAcquireCreated,
        Topic::CsReleaseCreated,
        Topic::CsChainStalled,
        Topic::TaskPosted,
        Topic::TaskResultPosted,
        Topic::BoardPublished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::NodeRegistered => "node-registered",
            Topic::NodeReparented => "node-reparented",
            Topic::NodeConnected => "node-connected",
            Topic::NodeDisconnected => "node-disconnected",
            Topic::CsRequestCreated => "cs-request-created",
            Topic::CsAcquireCreated => "cs-acquire-created",
            Topic::CsReleaseCreated => "cs-release-created",
            Topic::CsChainStalled => "cs-chain-stalled",
            Topic::TaskPosted => "task-posted",
            Topic::TaskResultPosted => "task-result-posted",
            Topic::BoardPublished => "board-published",
        }
    }

    pub fn parse(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every event the system emits. Closed set, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Event {
    Registered(RegisteredNode),
    Reparented(Reparented),
    Connected(ConnectedClient),
    Disconnected(DisconnectedClient),
    RequestHop(CsRequestHop),
    Acquired(CsAcquire),
    Released(CsRelease),
    ChainStalled(StalledChain),
    TaskPosted(Task),
    TaskResultPosted(TaskResult),
    BoardPublished(Board),
}

impl Event {
    /// The topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::Registered(_) => Topic::NodeRegistered,
            Event::Reparented(_) => Topic::NodeReparented,
            Event::Connected(_) => Topic::NodeConnected,
            Event::Disconnected(_) => Topic::NodeDisconnected,
            Event::RequestHop(_) => Topic::CsRequestCreated,
            Event::Acquired(_) => Topic::CsAcquireCreated,
            Event::Released(_) => Topic::CsReleaseCreated,
            Event::ChainStalled(_) => Topic::CsChainStalled,
            Event::TaskPosted(_) => Topic::TaskPosted,
            Event::TaskResultPosted(_) => Topic::TaskResultPosted,
            Event::BoardPublished(_) => Topic::BoardPublished,
        }
    }

    pub fn chain_id(&self) -> Option<&ChainId> {
        match self {
            Event::RequestHop(hop) => Some(&hop.chain_id),
            Event::Acquired(acq) => Some(&acq.chain_id),
            Event::ChainStalled(stalled) => Some(&stalled.chain_id),
            _ => None,
        }
    }
}

/// Errors decoding an envelope from the wire.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unsupported envelope version {0}")]
    Version(u32),
    #[error("Envelope id mismatch: claimed {claimed}, computed {computed}")]
    IdMismatch { claimed: EventId, computed: EventId },
    #[error("Event {kind} published on topic {topic}")]
    WrongTopic { kind: Topic, topic: Topic },
}

/// Wire envelope around one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub version: u32,
    /// SHA-256 hex of the canonical body. Redelivered copies share it.
    pub id: EventId,
    /// Runtime that emitted the event.
    pub from: String,
    pub emitted_at: Timestamp,
    pub event: Event,
}

impl EventEnvelope {
    /// Wrap an event and compute its content id.
    pub fn seal(from: impl Into<String>, event: Event, emitted_at: Timestamp) -> Result<Self, EnvelopeError> {
        let from = from.into();
        let id = compute_id(constants::PROTOCOL_VERSION, &from, emitted_at, &event)?;
        Ok(Self {
            version: constants::PROTOCOL_VERSION,
            id,
            from,
            emitted_at,
            event,
        })
    }

    pub fn topic(&self) -> Topic {
        self.event.topic()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and check an envelope received on `topic`.
    pub fn decode(topic: Topic, bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: EventEnvelope = serde_json::from_slice(bytes)?;
        if envelope.version != constants::PROTOCOL_VERSION {
            return Err(EnvelopeError::Version(envelope.version));
        }
        let computed = compute_id(envelope.version, &envelope.from, envelope.emitted_at, &envelope.event)?;
        if computed != envelope.id {
            return Err(EnvelopeError::IdMismatch {
                claimed: envelope.id,
                computed,
            });
        }
        if envelope.topic() != topic {
            return Err(EnvelopeError::WrongTopic {
                kind: envelope.topic(),
                topic,
            });
        }
        Ok(envelope)
    }
}

fn compute_id(version: u32, from: &str, emitted_at: Timestamp, event: &Event) -> Result<EventId, EnvelopeError> {
    let event = serde_json::to_value(event)?;
    let emitted_at = emitted_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
    Ok(content_id(version, from, &emitted_at, &event))
}
