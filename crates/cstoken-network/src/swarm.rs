//! libp2p swarm carrying events over GossipSub, with mDNS and Identify for discovery.

use libp2p::futures::StreamExt;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::{gossipsub, identify, mdns, noise, swarm::SwarmEvent, tcp, yamux, PeerId, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use cstoken_core::event::Topic;

use crate::bus::{BusError, EventBus, Subscribers, Subscription};
use crate::transport::{self, TransportCommand, TransportConfig};

/// Largest payload accepted on any topic. Published boards can be large.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

/// Composite network behaviour.
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct CsTokenBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub identify: identify::Behaviour,
}

/// Owns the libp2p swarm. Drive it with [`GossipSwarm::run`] on its own task.
pub struct GossipSwarm {
    swarm: Swarm<CsTokenBehaviour>,
    subscribers: Subscribers,
    command_rx: mpsc::UnboundedReceiver<TransportCommand>,
    config: TransportConfig,
}

/// Cloneable handle to a running [`GossipSwarm`].
#[derive(Debug, Clone)]
pub struct GossipBus {
    commands: mpsc::UnboundedSender<TransportCommand>,
    subscribers: Subscribers,
    local_peer_id: PeerId,
}

impl GossipSwarm {
    /// Build the swarm from a 32-byte ed25519 seed. Subscribes to every event topic.
    pub fn new(seed: [u8; 32], config: TransportConfig) -> anyhow::Result<(Self, GossipBus)> {
        let local_key = libp2p::identity::Keypair::ed25519_from_bytes(seed)?;
        let local_peer_id = PeerId::from(local_key.public());
        info!(peer_id = %local_peer_id, "Initializing gossip swarm");

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .max_transmit_size(MAX_MESSAGE_BYTES)
            .validation_mode(gossipsub::ValidationMode::Strict)
            .build()
            .map_err(|e| anyhow::anyhow!("GossipSub config error: {e}"))?;

        let mut gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(local_key.clone()),
            gossipsub_config,
        )
        .map_err(|e| anyhow::anyhow!("GossipSub init error: {e}"))?;

        for topic in Topic::ALL {
            let name = transport::topic_name(topic);
            gossipsub.subscribe(&gossipsub::IdentTopic::new(name.clone()))?;
            debug!(topic = %name, "Subscribed to GossipSub topic");
        }

        let mdns = if config.enable_mdns {
            Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
        } else {
            None
        };

        let identify = identify::Behaviour::new(identify::Config::new(
            transport::PROTOCOL_VERSION.to_string(),
            local_key.public(),
        ));

        let behaviour = CsTokenBehaviour {
            gossipsub,
            mdns: Toggle::from(mdns),
            identify,
        };

        let idle_timeout = config.idle_timeout;
        let swarm = SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
            .with_behaviour(|_| Ok(behaviour))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
            .build();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let subscribers = Subscribers::default();
        let bus = GossipBus {
            commands,
            subscribers: subscribers.clone(),
            local_peer_id,
        };
        let swarm = Self {
            swarm,
            subscribers,
            command_rx,
            config,
        };
        Ok((swarm, bus))
    }

    /// Listen on the configured addresses and dial the bootstrap peers.
    pub fn start(&mut self) -> anyhow::Result<()> {
        for addr in &self.config.listen_addrs {
            self.swarm.listen_on(addr.clone())?;
            info!(addr = %addr, "Listening on address");
        }
        for addr in &self.config.bootstrap_peers {
            if let Err(e) = self.swarm.dial(addr.clone()) {
                warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
            }
        }
        Ok(())
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Event loop. Returns once every [`GossipBus`] handle is dropped.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),

                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("All bus handles dropped, stopping swarm");
                        return Ok(());
                    }
                },
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<CsTokenBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(CsTokenBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let Some(topic) = transport::parse_topic_name(message.topic.as_str()) else {
                    debug!(topic = %message.topic, "Ignoring message on unknown topic");
                    return;
                };
                let receivers = self.subscribers.deliver(topic, &message.data);
                trace!(peer = %propagation_source, topic = %topic, receivers, "Gossip message");
            }

            SwarmEvent::Behaviour(CsTokenBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    if peer_id == self.local_peer_id() {
                        continue;
                    }
                    debug!(peer = %peer_id, addr = %addr, "mDNS discovered peer");
                    self.swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                    if let Err(e) = self.swarm.dial(addr) {
                        warn!(peer = %peer_id, error = %e, "Failed to dial mDNS peer");
                    }
                }
            }

            SwarmEvent::Behaviour(CsTokenBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _) in peers {
                    debug!(peer = %peer_id, "mDNS peer expired");
                    self.swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                }
            }

            SwarmEvent::Behaviour(CsTokenBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(peer = %peer_id, agent = %info.agent_version, "Identified peer");
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                info!(peer = %peer_id, addr = %endpoint.get_remote_address(), "Connection established");
            }

            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!(peer = %peer_id, cause = ?cause, "Connection closed");
            }

            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening on new address");
            }

            _ => {}
        }
    }

    fn handle_command(&mut self, cmd: TransportCommand) {
        match cmd {
            TransportCommand::Publish { topic, data, reply } => {
                let result = self.publish(topic, data);
                let _ = reply.send(result);
            }
            TransportCommand::Dial { addr } => {
                if let Err(e) = self.swarm.dial(addr.clone()) {
                    warn!(addr = %addr, error = %e, "Failed to dial peer");
                }
            }
        }
    }

    /// Publish to the mesh, then to local subscribers. GossipSub never echoes a
    /// message to its publisher, so local delivery happens here.
    fn publish(&mut self, topic: Topic, data: Vec<u8>) -> Result<(), BusError> {
        let ident = gossipsub::IdentTopic::new(transport::topic_name(topic));
        match self.swarm.behaviour_mut().gossipsub.publish(ident, data.clone()) {
            Ok(_) | Err(gossipsub::PublishError::Duplicate) => {}
            Err(gossipsub::PublishError::InsufficientPeers) => {
                debug!(topic = %topic, "No peers subscribed, delivering locally only");
            }
            Err(gossipsub::PublishError::MessageTooLarge) => {
                return Err(BusError::Rejected(format!("{} bytes on {topic}", data.len())));
            }
            Err(e) => return Err(BusError::BrokerUnavailable(e.to_string())),
        }
        self.subscribers.deliver(topic, &data);
        Ok(())
    }
}

impl GossipBus {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Ask the swarm to dial a peer.
    pub fn dial(&self, addr: libp2p::Multiaddr) -> Result<(), BusError> {
        self.commands
            .send(TransportCommand::Dial { addr })
            .map_err(|_| BusError::Closed)
    }
}

impl EventBus for GossipBus {
    async fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BusError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(TransportCommand::Publish {
                topic,
                data: payload,
                reply,
            })
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)?
    }

    fn subscribe(&self, topics: &[Topic]) -> Result<Subscription, BusError> {
        self.subscribers.add(topics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::multiaddr::Protocol;
    use libp2p::Multiaddr;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_config() -> TransportConfig {
        TransportConfig {
            listen_addrs: vec![Multiaddr::empty()
                .with(Protocol::Ip4(Ipv4Addr::LOCALHOST))
                .with(Protocol::Tcp(0))],
            bootstrap_peers: vec![],
            enable_mdns: false,
            dedup_capacity: 1000,
            idle_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn swarm_starts_listening() {
        let (mut swarm, _bus) = GossipSwarm::new([7u8; 32], test_config()).unwrap();
        assert!(swarm.start().is_ok());
    }

    #[tokio::test]
    async fn seed_determines_peer_id() {
        let (a, _) = GossipSwarm::new([1u8; 32], test_config()).unwrap();
        let (b, _) = GossipSwarm::new([1u8; 32], test_config()).unwrap();
        let (c, bus_c) = GossipSwarm::new([2u8; 32], test_config()).unwrap();
        assert_eq!(a.local_peer_id(), b.local_peer_id());
        assert_ne!(a.local_peer_id(), c.local_peer_id());
        assert_eq!(bus_c.local_peer_id(), c.local_peer_id());
    }

    #[tokio::test]
    async fn publish_without_peers_reaches_local_subscribers() {
        let (mut swarm, bus) = GossipSwarm::new([3u8; 32], test_config()).unwrap();
        swarm.start().unwrap();
        tokio::spawn(swarm.run());

        let mut sub = bus.subscribe(&[Topic::CsReleaseCreated]).unwrap();
        bus.publish(Topic::CsReleaseCreated, b"hello".to_vec()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload, b"hello");
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let (mut swarm, bus) = GossipSwarm::new([4u8; 32], test_config()).unwrap();
        swarm.start().unwrap();
        tokio::spawn(swarm.run());

        let err = bus
            .publish(Topic::BoardPublished, vec![0u8; MAX_MESSAGE_BYTES + 1])
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn dropped_swarm_closes_bus() {
        let (swarm, bus) = GossipSwarm::new([5u8; 32], test_config()).unwrap();
        drop(swarm);
        assert_eq!(
            bus.publish(Topic::NodeConnected, vec![1]).await,
            Err(BusError::Closed)
        );
    }
}
