//! Transport plumbing shared by the gossip swarm and the node: topic naming, the
//! swarm command channel, envelope deduplication and transport configuration.

use std::collections::{HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use tokio::sync::oneshot;

use cstoken_core::constants;
use cstoken_core::event::Topic;

use crate::bus::BusError;

/// Prefix of every GossipSub topic name.
pub const TOPIC_PREFIX: &str = "/cstoken/";

/// Identify protocol version string.
pub const PROTOCOL_VERSION: &str = "/cstoken/1.0.0";

/// GossipSub topic name for an event topic, e.g. `/cstoken/cs-request-created`.
pub fn topic_name(topic: Topic) -> String {
    format!("{TOPIC_PREFIX}{}", topic.as_str())
}

/// Inverse of [`topic_name`]. Unknown names yield `None`.
pub fn parse_topic_name(name: &str) -> Option<Topic> {
    name.strip_prefix(TOPIC_PREFIX).and_then(Topic::parse)
}

/// Commands sent to the swarm task.
#[derive(Debug)]
pub enum TransportCommand {
    /// Publish bytes on a topic. The outcome is reported on `reply`.
    Publish {
        topic: Topic,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), BusError>>,
    },
    /// Dial a peer at the given address.
    Dial { addr: Multiaddr },
}

/// Bounded cache of seen envelope ids. Oldest ids are evicted first.
#[derive(Debug)]
pub struct DedupCache {
    entries: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            set: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Returns true if the id was already seen; otherwise records it.
    pub fn check_and_insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return true;
        }
        if self.capacity == 0 {
            return false;
        }
        while self.entries.len() >= self.capacity {
            match self.entries.pop_front() {
                Some(oldest) => {
                    self.set.remove(&oldest);
                }
                None => break,
            }
        }
        self.set.insert(id.to_string());
        self.entries.push_back(id.to_string());
        false
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Configuration for the gossip transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_addrs: Vec<Multiaddr>,
    /// Peers dialed at startup.
    pub bootstrap_peers: Vec<Multiaddr>,
    /// mDNS discovery on the local network.
    pub enable_mdns: bool,
    pub dedup_capacity: usize,
    pub idle_timeout: Duration,
}

impl TransportConfig {
    /// `/ip4/0.0.0.0/tcp/<port>`; port 0 picks a free one.
    pub fn any_ip4(port: u16) -> Multiaddr {
        Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Tcp(port))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![Self::any_ip4(0)],
            bootstrap_peers: vec![],
            enable_mdns: true,
            dedup_capacity: constants::DEDUP_CACHE_SIZE,
            idle_timeout: Duration::from_secs(60),
        }
    }
}
