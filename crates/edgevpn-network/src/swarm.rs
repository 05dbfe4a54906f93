//! libp2p swarm event loop: GossipSub on rotating topics, Kademlia
//! rendezvous discovery, mDNS, Identify and the raw stream transport.
//!
//! The loop owns the only handle to the gossip behaviour. Upper layers
//! talk to it through the command channel and read decoded messages
//! from the event channel; per-destination byte streams are opened
//! through a cloned [`libp2p_stream::Control`] without touching the
//! loop at all.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use libp2p::futures::StreamExt;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::SwarmEvent as Libp2pEvent;
use libp2p::{
    connection_limits, gossipsub, identify, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId,
    StreamProtocol, Swarm, SwarmBuilder,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use edgevpn_core::ticker::BackoffTicker;

use crate::discovery::DhtRendezvous;
use crate::hub::TopicSchedule;
use crate::message::Message;

const EVENT_CHANNEL_SIZE: usize = 3000;
const COMMAND_CHANNEL_SIZE: usize = 3000;

/// Composite behaviour for an overlay node.
#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct Behaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kad: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub stream: libp2p_stream::Behaviour,
    pub limits: connection_limits::Behaviour,
}

/// Transport configuration for the swarm loop.
#[derive(Clone)]
pub struct SwarmConfig {
    pub listen_addrs: Vec<Multiaddr>,
    pub bootstrap_peers: Vec<Multiaddr>,
    pub enable_mdns: bool,
    pub max_message_size: usize,
    pub topics: TopicSchedule,
    /// Also join the cleartext channel used for authentication.
    pub join_public: bool,
    pub rendezvous: Option<DhtRendezvous>,
    pub discovery_interval: Duration,
    pub blocked_peers: Vec<PeerId>,
    pub blocked_subnets: Vec<IpNet>,
    /// Transport-level caps; `None` leaves a limit unenforced.
    pub max_connections: Option<u32>,
    pub max_connections_per_peer: Option<u32>,
}

/// Commands accepted by the swarm loop.
pub enum SwarmCommand {
    PublishPrivate(Message),
    PublishPublic(Message),
    Dial(Multiaddr),
    /// Peers currently subscribed to the private topic.
    ListPeers(oneshot::Sender<Vec<PeerId>>),
    /// Refuse dials and connections into this subnet from now on.
    /// The VPN registers its own subnet here once an address is
    /// known, so transport traffic never routes back through the
    /// tunnel.
    BlockSubnet(IpNet),
}

/// Decoded messages handed to the node loop.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    PrivateMessage(Message),
    PublicMessage(Message),
}

/// The swarm loop state.
pub struct NodeSwarm {
    swarm: Swarm<Behaviour>,
    config: SwarmConfig,
    command_rx: mpsc::Receiver<SwarmCommand>,
    event_tx: mpsc::Sender<SwarmEvent>,
    current_private: Option<gossipsub::IdentTopic>,
    current_public: Option<gossipsub::IdentTopic>,
    rendezvous: Option<DhtRendezvous>,
    /// Checked before every dial, not just after the handshake; a
    /// dial into a blocked subnet must never leave the host.
    blocked_peers: Vec<PeerId>,
    blocked_subnets: Vec<IpNet>,
}

impl NodeSwarm {
    /// Build the swarm. Returns the loop itself plus the command and
    /// event endpoints for the node.
    pub fn new(
        keypair: libp2p::identity::Keypair,
        config: SwarmConfig,
    ) -> anyhow::Result<(
        Self,
        mpsc::Sender<SwarmCommand>,
        mpsc::Receiver<SwarmEvent>,
    )> {
        let local_peer_id = PeerId::from(keypair.public());
        info!(peer_id = %local_peer_id, "initializing overlay swarm");

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .max_transmit_size(config.max_message_size)
            .validation_mode(gossipsub::ValidationMode::Strict)
            .build()
            .map_err(|e| anyhow::anyhow!("gossipsub config: {e}"))?;

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )
        .map_err(|e| anyhow::anyhow!("gossipsub init: {e}"))?;

        let mdns = if config.enable_mdns {
            Some(mdns::tokio::Behaviour::new(
                mdns::Config::default(),
                local_peer_id,
            )?)
        } else {
            None
        };

        let identify = identify::Behaviour::new(identify::Config::new(
            "/edgevpn/id/0.1".to_string(),
            keypair.public(),
        ));

        let store = kad::store::MemoryStore::new(local_peer_id);
        let mut kad = kad::Behaviour::new(local_peer_id, store);
        kad.set_mode(Some(kad::Mode::Server));

        let limits = connection_limits::Behaviour::new(
            connection_limits::ConnectionLimits::default()
                .with_max_established(config.max_connections)
                .with_max_established_per_peer(config.max_connections_per_peer),
        );

        let behaviour = Behaviour {
            gossipsub,
            kad,
            identify,
            mdns: Toggle::from(mdns),
            stream: libp2p_stream::Behaviour::new(),
            limits,
        };

        let swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_quic()
            .with_behaviour(|_| Ok(behaviour))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);

        let rendezvous = config.rendezvous.clone();
        let blocked_peers = config.blocked_peers.clone();
        let blocked_subnets = config.blocked_subnets.clone();
        Ok((
            Self {
                swarm,
                config,
                command_rx,
                event_tx,
                current_private: None,
                current_public: None,
                rendezvous,
                blocked_peers,
                blocked_subnets,
            },
            command_tx,
            event_rx,
        ))
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Handle for opening outbound streams and registering inbound
    /// stream handlers, usable from any task.
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.swarm.behaviour().stream.new_control()
    }

    /// Inbound streams for a protocol. Must be called once per
    /// protocol before `run`.
    pub fn incoming_streams(
        &self,
        protocol: StreamProtocol,
    ) -> anyhow::Result<libp2p_stream::IncomingStreams> {
        self.swarm
            .behaviour()
            .stream
            .new_control()
            .accept(protocol)
            .map_err(|e| anyhow::anyhow!("register stream protocol: {e}"))
    }

    pub fn start_listening(&mut self) -> anyhow::Result<()> {
        for addr in self.config.listen_addrs.clone() {
            self.swarm.listen_on(addr.clone())?;
            info!(addr = %addr, "listening");
        }
        for addr in self.config.bootstrap_peers.clone() {
            if self.addr_blocked(&addr) {
                debug!(addr = %addr, "refusing blocked bootstrap address");
                continue;
            }
            if let Err(e) = self.swarm.dial(addr.clone()) {
                debug!(addr = %addr, error = %e, "bootstrap dial failed");
            }
        }
        Ok(())
    }

    /// Run until the token cancels.
    pub async fn run(mut self, token: CancellationToken) {
        let mut rotate = tokio::time::interval(Duration::from_secs(1));
        let mut discover = BackoffTicker::capped(self.config.discovery_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,

                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,

                Some(cmd) = self.command_rx.recv() => self.handle_command(cmd),

                _ = rotate.tick() => self.rotate_topics(),

                _ = discover.tick() => self.announce_rendezvous(),
            }
        }
    }

    /// Re-derive the topic names; on a window boundary drop the old
    /// subscriptions and join the new ones.
    fn rotate_topics(&mut self) {
        let private = gossipsub::IdentTopic::new(self.config.topics.private_topic());
        let changed = self
            .current_private
            .as_ref()
            .map(|t| t.hash() != private.hash())
            .unwrap_or(true);
        if !changed {
            return;
        }

        let gossipsub = &mut self.swarm.behaviour_mut().gossipsub;
        if let Some(old) = self.current_private.take() {
            let _ = gossipsub.unsubscribe(&old);
        }
        if let Some(old) = self.current_public.take() {
            let _ = gossipsub.unsubscribe(&old);
        }

        match gossipsub.subscribe(&private) {
            Ok(_) => {
                debug!(topic = %private, "joined rotated topic");
                self.current_private = Some(private);
            }
            Err(e) => warn!(error = %e, "failed to join rotated topic"),
        }

        if self.config.join_public {
            let public = gossipsub::IdentTopic::new(self.config.topics.public_topic());
            match gossipsub.subscribe(&public) {
                Ok(_) => self.current_public = Some(public),
                Err(e) => warn!(error = %e, "failed to join public topic"),
            }
        }
    }

    /// Announce the current (and previous) rendezvous window on the
    /// DHT and look for peers doing the same.
    fn announce_rendezvous(&mut self) {
        let Some(rendezvous) = self.rendezvous.as_mut() else {
            return;
        };
        for rv in rendezvous.announce_set() {
            let key = DhtRendezvous::record_key(&rv);
            let kad = &mut self.swarm.behaviour_mut().kad;
            if let Err(e) = kad.start_providing(key.clone()) {
                debug!(error = %e, "rendezvous announce failed");
            }
            kad.get_providers(key);
            debug!(rendezvous = %rv, "announced rendezvous window");
        }
    }

    async fn handle_swarm_event(&mut self, event: Libp2pEvent<BehaviourEvent>) {
        match event {
            Libp2pEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                self.handle_gossip_message(propagation_source, message).await;
            }

            Libp2pEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer, addr) in peers {
                    if peer == self.local_peer_id() {
                        continue;
                    }
                    if self.is_blocked(&peer, &addr) {
                        debug!(peer = %peer, addr = %addr, "refusing blocked mDNS peer");
                        continue;
                    }
                    debug!(peer = %peer, addr = %addr, "mDNS discovered peer");
                    if let Err(e) = self.swarm.dial(addr.clone()) {
                        debug!(peer = %peer, error = %e, "mDNS dial failed");
                    }
                }
            }

            Libp2pEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&peer_id, addr.clone());
                }
            }

            Libp2pEvent::Behaviour(BehaviourEvent::Kad(
                kad::Event::OutboundQueryProgressed {
                    result:
                        kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                            providers,
                            ..
                        })),
                    ..
                },
            )) => {
                for peer in providers {
                    if peer == self.local_peer_id() || self.swarm.is_connected(&peer) {
                        continue;
                    }
                    if self.peer_blocked(&peer) {
                        debug!(peer = %peer, "refusing blocked rendezvous provider");
                        continue;
                    }
                    debug!(peer = %peer, "dialing rendezvous provider");
                    if let Err(e) = self.swarm.dial(peer) {
                        debug!(peer = %peer, error = %e, "provider dial failed");
                    }
                }
            }

            Libp2pEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                let remote = endpoint.get_remote_address();
                if self.is_blocked(&peer_id, remote) {
                    warn!(peer = %peer_id, addr = %remote, "disconnecting blocked peer");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                debug!(peer = %peer_id, addr = %remote, "connection established");
            }

            Libp2pEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!(peer = %peer_id, cause = ?cause, "connection closed");
            }

            Libp2pEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "listening on new address");
            }

            _ => {}
        }
    }

    async fn handle_gossip_message(&mut self, source: PeerId, message: gossipsub::Message) {
        if message.source == Some(self.local_peer_id()) {
            return;
        }

        let mut decoded: Message = match serde_json::from_slice(&message.data) {
            Ok(m) => m,
            Err(e) => {
                debug!(peer = %source, error = %e, "undecodable gossip envelope");
                return;
            }
        };
        decoded.sender = message.source.unwrap_or(source).to_string();

        let event = if Some(&message.topic) == self.current_private.as_ref().map(|t| t.hash()).as_ref()
        {
            SwarmEvent::PrivateMessage(decoded)
        } else if Some(&message.topic) == self.current_public.as_ref().map(|t| t.hash()).as_ref() {
            SwarmEvent::PublicMessage(decoded)
        } else {
            // A stale window: the sender has not rotated yet.
            debug!(topic = %message.topic, "message on unknown topic");
            return;
        };

        if self.event_tx.send(event).await.is_err() {
            debug!("event channel closed");
        }
    }

    fn handle_command(&mut self, cmd: SwarmCommand) {
        match cmd {
            SwarmCommand::PublishPrivate(message) => {
                let Some(topic) = self.current_private.clone() else {
                    debug!("no private topic joined yet, dropping publish");
                    return;
                };
                self.publish(topic, &message);
            }
            SwarmCommand::PublishPublic(message) => {
                let Some(topic) = self.current_public.clone() else {
                    debug!("no public topic joined yet, dropping publish");
                    return;
                };
                self.publish(topic, &message);
            }
            SwarmCommand::Dial(addr) => {
                if self.addr_blocked(&addr) {
                    debug!(addr = %addr, "refusing to dial blocked address");
                    return;
                }
                if let Err(e) = self.swarm.dial(addr.clone()) {
                    debug!(addr = %addr, error = %e, "dial failed");
                }
            }
            SwarmCommand::BlockSubnet(subnet) => {
                let subnet = subnet.trunc();
                info!(subnet = %subnet, "blocking subnet");
                if !self.blocked_subnets.contains(&subnet) {
                    self.blocked_subnets.push(subnet);
                }
            }
            SwarmCommand::ListPeers(reply) => {
                let peers = match &self.current_private {
                    Some(topic) => {
                        let hash = topic.hash();
                        self.swarm
                            .behaviour()
                            .gossipsub
                            .all_peers()
                            .filter(|(_, topics)| topics.contains(&&hash))
                            .map(|(p, _)| *p)
                            .collect()
                    }
                    None => Vec::new(),
                };
                let _ = reply.send(peers);
            }
        }
    }

    fn publish(&mut self, topic: gossipsub::IdentTopic, message: &Message) {
        let data = match serde_json::to_vec(message) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to encode message");
                return;
            }
        };
        if let Err(e) = self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(topic, data)
        {
            debug!(error = %e, "publish failed");
        }
    }

    fn peer_blocked(&self, peer: &PeerId) -> bool {
        self.blocked_peers.contains(peer)
    }

    fn addr_blocked(&self, addr: &Multiaddr) -> bool {
        let Some(ip) = multiaddr_ip(addr) else {
            return false;
        };
        self.blocked_subnets.iter().any(|net| net.contains(&ip))
    }

    fn is_blocked(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        self.peer_blocked(peer) || self.addr_blocked(addr)
    }
}

fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    use libp2p::multiaddr::Protocol;
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}
