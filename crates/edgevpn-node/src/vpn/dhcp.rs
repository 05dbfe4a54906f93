//! DHCP-style address assignment, run before the TUN device opens.
//!
//! There is no consensus layer, only the hash tiebreaker: among the
//! alive nodes that still need an address, the one with the highest
//! FNV-32a peer-id hash claims leadership through a reconciling write
//! to `dhcp/leader`, then assigns itself the next free address.
//! Everyone else waits and re-evaluates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use edgevpn_core::types::Machine;
use edgevpn_core::utils::{leader, next_ip};
use edgevpn_core::{Data, Ledger};
use edgevpn_crypto::md5_hex;
use edgevpn_protocol::bucket;

use crate::node::Node;
use crate::services::alive;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const CLAIM_INTERVAL: Duration = Duration::from_secs(5);
const CLAIM_TIMEOUT: Duration = Duration::from_secs(15);

/// Parameters of the assignment loop.
#[derive(Debug, Clone)]
pub struct DhcpConfig {
    /// Where leases are cached between runs.
    pub lease_dir: PathBuf,
    /// First address handed out on a fresh network.
    pub base_address: String,
    /// Peers silent for longer than this are not counted as alive.
    pub max_time: Duration,
}

/// The lease file for a given exchange key.
pub fn lease_file(lease_dir: &Path, exchange_key: &str) -> PathBuf {
    lease_dir.join(md5_hex(&format!("{exchange_key}-ek")))
}

/// A previously granted lease, if one is cached on disk.
pub fn check_lease(lease_dir: &Path, exchange_key: &str) -> Option<String> {
    let lease = std::fs::read_to_string(lease_file(lease_dir, exchange_key)).ok()?;
    let lease = lease.trim().to_string();
    (!lease.is_empty()).then_some(lease)
}

/// One round of the assignment protocol, as a pure decision.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Wait,
    ClaimLeadership,
    Assign(String),
}

fn next_step(
    me: &str,
    alive_nodes: &[String],
    current_ips: &BTreeMap<String, String>,
    leader_entry: Option<&str>,
    base_address: &str,
) -> Step {
    let needy: Vec<String> = alive_nodes
        .iter()
        .filter(|n| !current_ips.contains_key(*n))
        .cloned()
        .collect();

    // Not enough context to decide anything yet.
    if alive_nodes.len() <= 1 || needy.is_empty() {
        return Step::Wait;
    }

    let should_be_leader = leader(&needy).unwrap_or_default();
    let lead = leader_entry.unwrap_or_default();

    if should_be_leader != me && lead != me {
        return Step::Wait;
    }
    if should_be_leader == me && (lead.is_empty() || !needy.iter().any(|n| n == lead)) {
        return Step::ClaimLeadership;
    }
    if lead != me {
        return Step::Wait;
    }

    let used: Vec<String> = current_ips.values().cloned().collect();
    match next_ip(base_address, &used) {
        Some(ip) => Step::Assign(ip),
        None => Step::Wait,
    }
}

/// Block until this node holds an address, claiming leadership along
/// the way when the hash says so. The granted lease is cached on disk
/// keyed by the exchange key.
pub async fn acquire(
    node: &Arc<Node>,
    ledger: &Arc<Ledger>,
    token: CancellationToken,
    config: &DhcpConfig,
    exchange_key: &str,
) -> anyhow::Result<String> {
    std::fs::create_dir_all(&config.lease_dir)
        .with_context(|| format!("creating lease dir {}", config.lease_dir.display()))?;

    if let Some(lease) = check_lease(&config.lease_dir, exchange_key) {
        info!(lease = %lease, "reusing cached lease");
        return Ok(lease);
    }

    let me = node.peer_id().to_string();
    let wanted = loop {
        tokio::select! {
            _ = token.cancelled() => anyhow::bail!("cancelled before an address was assigned"),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let alive_nodes = alive::available_nodes(ledger, config.max_time);

        let mut current_ips = BTreeMap::new();
        if let Some(machines) = ledger.current_data().get(bucket::MACHINES) {
            for value in machines.values() {
                if let Ok(machine) = value.decode::<Machine>() {
                    debug!(peer = %machine.peer_id, address = %machine.address, "holds an address");
                    current_ips.insert(machine.peer_id, machine.address);
                }
            }
        }

        let lead: Option<String> = ledger
            .get_key(bucket::DHCP, "leader")
            .and_then(|d| d.decode().ok());

        match next_step(
            &me,
            &alive_nodes,
            &current_ips,
            lead.as_deref(),
            &config.base_address,
        ) {
            Step::Wait => debug!("waiting for an address"),
            Step::ClaimLeadership => {
                info!("claiming assignment leadership");
                ledger.persist(
                    token.clone(),
                    CLAIM_INTERVAL,
                    CLAIM_TIMEOUT,
                    bucket::DHCP,
                    "leader",
                    Data::encode(&me),
                );
            }
            Step::Assign(ip) => break ip,
        }
    };

    let lease = lease_file(&config.lease_dir, exchange_key);
    debug!(path = %lease.display(), "writing lease");
    std::fs::write(&lease, &wanted)
        .with_context(|| format!("writing lease {}", lease.display()))?;
    info!(address = %wanted, "address assigned");
    Ok(wanted)
}
