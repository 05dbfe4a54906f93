//! Node configuration. One explicit struct, validated when the node is
//! built; no option chains.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ipnet::IpNet;
use libp2p::{Multiaddr, PeerId};
use tracing::info;

use edgevpn_core::store::{DiskStore, MemoryStore, Store};
use edgevpn_core::token::ConnectionToken;
use edgevpn_crypto::{AesSealer, Sealer};
use edgevpn_network::discovery::DhtRendezvous;
use edgevpn_network::{SwarmConfig, TopicSchedule};

use crate::node::Gater;

/// Where adopted blocks live.
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    /// Keep only the head in memory.
    #[default]
    Memory,
    /// Persist every adopted block under the given directory.
    Disk(PathBuf),
}

/// Everything a node needs to join a network.
#[derive(Clone)]
pub struct NodeConfig {
    /// The shared connection token. Required.
    pub token: Option<ConnectionToken>,

    pub listen_addrs: Vec<Multiaddr>,
    pub bootstrap_peers: Vec<Multiaddr>,
    pub enable_dht: bool,
    pub enable_mdns: bool,
    pub discovery_interval: Duration,

    pub ledger_announce_interval: Duration,
    pub ledger_sync_interval: Duration,
    pub store: StoreConfig,

    /// Join the cleartext channel used for trust-zone authentication.
    pub join_public: bool,

    /// Identity key as libp2p protobuf bytes; generated when absent.
    pub private_key: Option<Vec<u8>>,
    /// On-disk identity cache, written on first start.
    pub key_cache: Option<PathBuf>,

    /// Static address → peer routing table. When non-empty it also
    /// acts as an allowlist on the private channel.
    pub peer_table: BTreeMap<String, PeerId>,
    /// Peer IDs and CIDR subnets that are never dialed or accepted.
    pub blacklist: Vec<String>,
    /// Transport-level connection caps; `None` means unenforced.
    pub max_connections: Option<u32>,
    pub max_connections_per_peer: Option<u32>,

    pub sealer: Arc<dyn Sealer>,
    pub gater: Option<Arc<dyn Gater>>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            token: None,
            listen_addrs: vec![],
            bootstrap_peers: vec![],
            enable_dht: true,
            enable_mdns: true,
            discovery_interval: Duration::from_secs(5 * 60),
            ledger_announce_interval: Duration::from_secs(5),
            ledger_sync_interval: Duration::from_secs(5),
            store: StoreConfig::Memory,
            join_public: true,
            private_key: None,
            key_cache: None,
            peer_table: BTreeMap::new(),
            blacklist: vec![],
            max_connections: None,
            max_connections_per_peer: None,
            sealer: Arc::new(AesSealer),
            gater: None,
        }
    }
}

impl NodeConfig {
    /// Load or create the identity keypair. The on-disk cache is
    /// written once, with owner-only permissions.
    pub fn identity(&self) -> anyhow::Result<libp2p::identity::Keypair> {
        if let Some(bytes) = &self.private_key {
            return libp2p::identity::Keypair::from_protobuf_encoding(bytes)
                .context("invalid identity key");
        }

        if let Some(path) = &self.key_cache {
            if path.exists() {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("reading identity cache {}", path.display()))?;
                return libp2p::identity::Keypair::from_protobuf_encoding(&bytes)
                    .context("corrupt identity cache");
            }
            let keypair = libp2p::identity::Keypair::generate_ed25519();
            let bytes = keypair
                .to_protobuf_encoding()
                .context("encoding identity key")?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)
                .with_context(|| format!("writing identity cache {}", path.display()))?;
            restrict_permissions(path)?;
            info!(path = %path.display(), "cached fresh identity key");
            return Ok(keypair);
        }

        Ok(libp2p::identity::Keypair::generate_ed25519())
    }

    pub fn open_store(&self) -> anyhow::Result<Box<dyn Store>> {
        match &self.store {
            StoreConfig::Memory => Ok(Box::new(MemoryStore::new())),
            StoreConfig::Disk(path) => Ok(Box::new(
                DiskStore::open(path)
                    .with_context(|| format!("opening block store {}", path.display()))?,
            )),
        }
    }

    /// Derive the transport configuration from the token.
    pub fn swarm_config(&self, token: &ConnectionToken) -> anyhow::Result<SwarmConfig> {
        let (blocked_peers, blocked_subnets) = self.parse_blacklist()?;
        let rendezvous = self.enable_dht.then(|| {
            DhtRendezvous::new(
                token.otp.dht.key.clone(),
                token.otp.dht.length as usize,
                token.otp.dht.interval as u64,
                token.rendezvous.clone(),
            )
        });

        Ok(SwarmConfig {
            listen_addrs: self.listen_addrs.clone(),
            bootstrap_peers: self.bootstrap_peers.clone(),
            enable_mdns: self.enable_mdns,
            max_message_size: token.max_message_size,
            topics: TopicSchedule::new(
                token.room.clone(),
                token.otp.crypto.length as usize,
                token.otp.crypto.interval as u64,
            ),
            join_public: self.join_public,
            rendezvous,
            discovery_interval: self.discovery_interval,
            blocked_peers,
            blocked_subnets,
            max_connections: self.max_connections,
            max_connections_per_peer: self.max_connections_per_peer,
        })
    }

    /// Each blacklist entry is a CIDR subnet or, failing that, a peer
    /// ID.
    fn parse_blacklist(&self) -> anyhow::Result<(Vec<PeerId>, Vec<IpNet>)> {
        let mut peers = Vec::new();
        let mut subnets = Vec::new();
        for entry in &self.blacklist {
            if let Ok(net) = entry.parse::<IpNet>() {
                subnets.push(net);
            } else {
                peers.push(
                    entry
                        .parse::<PeerId>()
                        .with_context(|| format!("blacklist entry {entry} is neither CIDR nor peer id"))?,
                );
            }
        }
        Ok((peers, subnets))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_cache_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privkey");
        let cfg = NodeConfig {
            key_cache: Some(path.clone()),
            ..NodeConfig::default()
        };
        let first = cfg.identity().unwrap();
        assert!(path.exists());
        let second = cfg.identity().unwrap();
        assert_eq!(
            PeerId::from(first.public()),
            PeerId::from(second.public())
        );
    }

    #[cfg(unix)]
    #[test]
    fn identity_cache_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privkey");
        let cfg = NodeConfig {
            key_cache: Some(path.clone()),
            ..NodeConfig::default()
        };
        cfg.identity().unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn blacklist_distinguishes_subnets_from_peers() {
        let peer = PeerId::random();
        let cfg = NodeConfig {
            blacklist: vec!["10.1.0.0/24".to_string(), peer.to_string()],
            ..NodeConfig::default()
        };
        let (peers, subnets) = cfg.parse_blacklist().unwrap();
        assert_eq!(peers, vec![peer]);
        assert_eq!(subnets.len(), 1);
    }

    #[test]
    fn malformed_blacklist_entries_are_fatal() {
        let cfg = NodeConfig {
            blacklist: vec!["certainly not valid".to_string()],
            ..NodeConfig::default()
        };
        assert!(cfg.parse_blacklist().is_err());
    }

    #[test]
    fn swarm_config_inherits_the_token_shape() {
        let token = ConnectionToken::generate();
        let cfg = NodeConfig {
            token: Some(token.clone()),
            ..NodeConfig::default()
        };
        let swarm = cfg.swarm_config(&token).unwrap();
        assert_eq!(swarm.max_message_size, token.max_message_size);
        assert!(swarm.rendezvous.is_some());
    }
}
