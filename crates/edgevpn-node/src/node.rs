//! Node assembly and the sealed event loop.
//!
//! Outbound ledger traffic is sealed with the window key and published
//! on the private topic. Inbound private messages pass two filters in
//! order (peer gater, then the static peer table), are unsealed, and
//! fan out to the registered handlers with the ledger adopter first.
//! Gated messages are dropped silently; unseal failures are logged and
//! forwarded with the opaque payload untouched so handlers still see
//! who sent what.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use ipnet::IpNet;
use libp2p::{PeerId, StreamProtocol};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use edgevpn_core::{Ledger, Store};
use edgevpn_crypto::{md5_hex, otp, Sealer};
use edgevpn_network::{Message, NodeSwarm, SwarmCommand, SwarmEvent};

use crate::config::NodeConfig;

/// A message after inbound processing: unsealed payload (or the
/// opaque original when unsealing failed), the transport-attested
/// sender, and whatever annotations it carried.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub payload: Vec<u8>,
    pub sender: PeerId,
    pub annotations: Option<edgevpn_network::Annotations>,
}

impl Inbound {
    /// The payload as text, for cleartext-channel handlers.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Handler invoked for every delivered message on a channel.
pub type Handler = Arc<dyn Fn(&Arc<Ledger>, &Inbound) -> anyhow::Result<()> + Send + Sync>;

/// Admission filter for inbound private messages. Returning `true`
/// drops the message.
pub trait Gater: Send + Sync {
    fn gate(&self, peer: &PeerId) -> bool;
    fn enable(&self);
    fn disable(&self);
    fn enabled(&self) -> bool;
}

struct StartState {
    swarm: NodeSwarm,
    events: mpsc::Receiver<SwarmEvent>,
    input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    public_rx: mpsc::Receiver<Message>,
}

/// One overlay node.
pub struct Node {
    peer_id: PeerId,
    ledger: Arc<Ledger>,
    sealer: Arc<dyn Sealer>,
    gater: Option<Arc<dyn Gater>>,
    peer_table: BTreeMap<String, PeerId>,
    join_public: bool,

    exchange_key: String,
    seal_key_length: usize,
    seal_key_interval: u64,
    ledger_sync_interval: std::time::Duration,

    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    public_tx: mpsc::Sender<Message>,
    commands: mpsc::Sender<SwarmCommand>,
    control: libp2p_stream::Control,

    handlers: Mutex<Vec<Handler>>,
    public_handlers: Mutex<Vec<Handler>>,
    start_state: Mutex<Option<StartState>>,
}

impl Node {
    /// Build the node from a validated configuration. Fatal problems
    /// (bad token, bad identity key, store errors) surface here.
    pub fn new(config: NodeConfig) -> anyhow::Result<Arc<Node>> {
        let token = config.token.clone().context("a connection token is required")?;
        let keypair = config.identity()?;
        let store: Box<dyn Store> = config.open_store()?;

        let swarm_config = config.swarm_config(&token)?;
        let (swarm, commands, events) = NodeSwarm::new(keypair, swarm_config)?;
        let peer_id = swarm.local_peer_id();
        let control = swarm.stream_control();

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (public_tx, public_rx) = mpsc::channel(3000);
        let ledger = Ledger::new(input_tx.clone(), store);

        info!(peer_id = %peer_id, "node initialized");

        Ok(Arc::new(Node {
            peer_id,
            ledger,
            sealer: config.sealer.clone(),
            gater: config.gater.clone(),
            peer_table: config.peer_table.clone(),
            join_public: config.join_public,
            exchange_key: token.otp.crypto.key.clone(),
            seal_key_length: token.otp.crypto.length as usize,
            seal_key_interval: token.otp.crypto.interval as u64,
            ledger_sync_interval: config.ledger_sync_interval,
            input_tx,
            public_tx,
            commands,
            control,
            handlers: Mutex::new(Vec::new()),
            public_handlers: Mutex::new(Vec::new()),
            start_state: Mutex::new(Some(StartState {
                swarm,
                events,
                input_rx,
                public_rx,
            })),
        }))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The ledger backing this node.
    pub fn ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }

    /// The peer gater, when one is configured.
    pub fn gater(&self) -> Option<Arc<dyn Gater>> {
        self.gater.clone()
    }

    /// The static address → peer table, when configured.
    pub fn peer_table(&self) -> &BTreeMap<String, PeerId> {
        &self.peer_table
    }

    /// Register a handler for unsealed private-channel messages.
    pub fn add_handler(&self, handler: Handler) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Register a handler for cleartext public-channel messages.
    pub fn add_public_handler(&self, handler: Handler) {
        self.public_handlers.lock().unwrap().push(handler);
    }

    /// Handle for opening outbound byte streams to peers.
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.control.clone()
    }

    /// Inbound byte streams for a protocol. One registration per
    /// protocol per process.
    pub fn accept_streams(
        &self,
        protocol: StreamProtocol,
    ) -> anyhow::Result<libp2p_stream::IncomingStreams> {
        self.control
            .clone()
            .accept(protocol)
            .map_err(|e| anyhow::anyhow!("register stream protocol: {e}"))
    }

    /// Publish a cleartext message on the public channel.
    pub fn publish_message(&self, message: Message) -> anyhow::Result<()> {
        if !self.join_public {
            anyhow::bail!("the public channel is disabled");
        }
        self.public_tx
            .try_send(message)
            .map_err(|_| anyhow::anyhow!("public channel backlogged"))
    }

    /// Refuse transport dials and connections into this subnet from
    /// now on. The VPN calls this with its own subnet as soon as an
    /// address is known, static or DHCP-assigned.
    pub async fn block_subnet(&self, subnet: IpNet) -> anyhow::Result<()> {
        self.commands
            .send(SwarmCommand::BlockSubnet(subnet))
            .await
            .map_err(|_| anyhow::anyhow!("swarm loop gone"))
    }

    /// Peers currently subscribed to the private topic.
    pub async fn list_peers(&self) -> anyhow::Result<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::ListPeers(reply))
            .await
            .map_err(|_| anyhow::anyhow!("swarm loop gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("swarm loop gone"))
    }

    /// The sealing key for the current window.
    fn seal_key(&self) -> String {
        md5_hex(&otp::totp_now(
            &self.exchange_key,
            self.seal_key_length,
            self.seal_key_interval,
        ))
    }

    /// Join the network and start the event loop, the ledger adopter
    /// and the synchronizer. Everything runs until `token` cancels.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        let state = self
            .start_state
            .lock()
            .unwrap()
            .take()
            .context("node already started")?;

        info!("starting overlay network");

        let StartState {
            mut swarm,
            events,
            input_rx,
            public_rx,
        } = state;

        swarm.start_listening()?;
        tokio::spawn(swarm.run(token.clone()));

        let node = self.clone();
        let events_token = token.clone();
        tokio::spawn(async move {
            node.handle_events(events_token, events, input_rx, public_rx)
                .await;
        });

        self.ledger.syncronizer(token, self.ledger_sync_interval);

        debug!("network started");
        Ok(())
    }

    async fn handle_events(
        self: Arc<Self>,
        token: CancellationToken,
        mut events: mpsc::Receiver<SwarmEvent>,
        mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut public_rx: mpsc::Receiver<Message>,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,

                Some(payload) = input_rx.recv() => self.seal_and_publish(payload).await,

                Some(message) = public_rx.recv() => {
                    if self.commands.send(SwarmCommand::PublishPublic(message)).await.is_err() {
                        return;
                    }
                }

                Some(event) = events.recv() => match event {
                    SwarmEvent::PrivateMessage(message) => self.handle_private(message),
                    SwarmEvent::PublicMessage(message) => self.handle_public(message),
                },

                else => return,
            }
        }
    }

    async fn seal_and_publish(&self, payload: Vec<u8>) {
        let sealed = match self.sealer.seal(&payload, &self.seal_key()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to seal outbound message");
                return;
            }
        };
        let message = Message::new(sealed);
        if self
            .commands
            .send(SwarmCommand::PublishPrivate(message))
            .await
            .is_err()
        {
            debug!("swarm loop gone, dropping outbound message");
        }
    }

    fn handle_private(&self, message: Message) {
        let Ok(sender) = message.sender.parse::<PeerId>() else {
            debug!(sender = %message.sender, "unparseable sender id");
            return;
        };

        if let Some(gater) = &self.gater {
            if gater.gate(&sender) {
                warn!(peer = %sender, "gated message");
                return;
            }
        }
        if !self.peer_table.is_empty() && !self.peer_table.values().any(|p| *p == sender) {
            warn!(peer = %sender, "gated message, not in the peer table");
            return;
        }

        let payload = match self.sealer.unseal(&message.message, &self.seal_key()) {
            Ok(p) => p,
            Err(e) => {
                // Keep the envelope observable, payload stays opaque.
                warn!(peer = %sender, error = %e, "unseal failed");
                message.message.clone().into_bytes()
            }
        };

        let inbound = Inbound {
            payload,
            sender,
            annotations: message.annotations,
        };

        if let Err(e) = self.ledger.update(&inbound.payload) {
            debug!(peer = %sender, error = %e, "ignoring unadoptable head");
        }
        for handler in self.handlers.lock().unwrap().iter() {
            if let Err(e) = handler(&self.ledger, &inbound) {
                warn!(error = %e, "handler error");
            }
        }
    }

    fn handle_public(&self, message: Message) {
        let Ok(sender) = message.sender.parse::<PeerId>() else {
            debug!(sender = %message.sender, "unparseable sender id");
            return;
        };
        let inbound = Inbound {
            payload: message.message.into_bytes(),
            sender,
            annotations: message.annotations,
        };
        for handler in self.public_handlers.lock().unwrap().iter() {
            if let Err(e) = handler(&self.ledger, &inbound) {
                warn!(error = %e, "public handler error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgevpn_core::token::ConnectionToken;

    // mDNS stays off so tests do not contend for the multicast socket.
    fn config() -> NodeConfig {
        NodeConfig {
            token: Some(ConnectionToken::generate()),
            enable_mdns: false,
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn node_requires_a_token() {
        let result = Node::new(NodeConfig::default());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn node_builds_from_a_generated_token() {
        let node = Node::new(config()).unwrap();
        assert_eq!(node.ledger().index(), 0);
    }

    #[tokio::test]
    async fn public_channel_rejected_when_disabled() {
        let mut cfg = config();
        cfg.join_public = false;
        let node = Node::new(cfg).unwrap();
        assert!(node.publish_message(Message::new("challenge")).is_err());
    }

    #[tokio::test]
    async fn seal_key_is_stable_within_a_window() {
        let node = Node::new(config()).unwrap();
        assert_eq!(node.seal_key(), node.seal_key());
    }

    #[tokio::test]
    async fn double_start_fails() {
        let node = Node::new(config()).unwrap();
        let token = CancellationToken::new();
        node.start(token.clone()).await.unwrap();
        assert!(node.start(token.clone()).await.is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn gated_messages_never_reach_handlers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct DenyAll;
        impl Gater for DenyAll {
            fn gate(&self, _peer: &PeerId) -> bool {
                true
            }
            fn enable(&self) {}
            fn disable(&self) {}
            fn enabled(&self) -> bool {
                true
            }
        }

        let mut cfg = config();
        cfg.gater = Some(Arc::new(DenyAll));
        let node = Node::new(cfg).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        node.add_handler(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let mut message = Message::new("anything");
        message.sender = PeerId::random().to_string();
        node.handle_private(message);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unseal_failure_passes_the_opaque_payload_through() {
        let node = Node::new(config()).unwrap();

        let observed: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        node.add_handler(Arc::new(move |_, inbound| {
            sink.lock().unwrap().push(inbound.payload.clone());
            Ok(())
        }));

        let mut message = Message::new("definitely-not-ciphertext");
        message.sender = PeerId::random().to_string();
        node.handle_private(message);

        let seen = observed.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], b"definitely-not-ciphertext");
    }
}
