//! The VPN data plane: moves L3 packets between the local TUN device
//! and per-destination peer streams, using the `machines` bucket as
//! the routing table.
//!
//! Frame ordering across destinations is not preserved; within one
//! destination it is preserved only with `concurrency = 1`, which IP
//! tolerates.

pub mod dhcp;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{AsyncReadExt as _, AsyncWriteExt as _};
use ipnet::IpNet;
use libp2p::PeerId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use edgevpn_core::types::Machine;
use edgevpn_core::{Data, Ledger};
use edgevpn_network::{Manager, ManagerConfig, SharedStream};
use edgevpn_protocol::bucket;

use crate::node::Node;

/// Runtime parameters of the data plane.
#[derive(Debug, Clone)]
pub struct VpnConfig {
    pub interface_name: String,
    /// CIDR assigned to the TUN device.
    pub interface_address: String,
    /// Fallback destination for addresses with no machine record.
    pub router_address: String,
    pub interface_mtu: u16,
    pub packet_mtu: usize,
    pub concurrency: usize,
    pub channel_buffer_size: usize,
    pub announce_interval: Duration,
    pub frame_timeout: Duration,
    /// Cache outbound streams behind watermarked eviction.
    pub low_profile: bool,
    pub max_streams: usize,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            interface_name: "edgevpn0".into(),
            interface_address: String::new(),
            router_address: String::new(),
            interface_mtu: 1450,
            packet_mtu: 1420,
            concurrency: 1,
            channel_buffer_size: 256,
            announce_interval: Duration::from_secs(5),
            frame_timeout: Duration::from_secs(15),
            low_profile: false,
            max_streams: 30,
        }
    }
}

struct Plane {
    local_ip: IpAddr,
    router_address: String,
    frame_timeout: Duration,
    ledger: Arc<Ledger>,
    peer_table: BTreeMap<String, PeerId>,
    manager: Option<Manager<SharedStream>>,
    control: libp2p_stream::Control,
}

/// Open the TUN device and run the data plane until cancelled.
pub async fn start(
    config: VpnConfig,
    node: Arc<Node>,
    ledger: Arc<Ledger>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let net: IpNet = config
        .interface_address
        .parse()
        .with_context(|| format!("interface address {:?}", config.interface_address))?;
    let local_ip = net.addr();

    let mut tun_config = tun::Configuration::default();
    tun_config
        .name(&config.interface_name)
        .address(local_ip)
        .netmask(net.netmask())
        .mtu(config.interface_mtu as i32)
        .up();
    let device = tun::create_as_async(&tun_config).context("creating the TUN device")?;
    info!(interface = %config.interface_name, address = %net, "TUN device up");
    let (mut tun_reader, tun_writer) = tokio::io::split(device);
    let tun_writer = Arc::new(Mutex::new(tun_writer));

    let manager = config
        .low_profile
        .then(|| Manager::new(10, config.max_streams, ManagerConfig::default()));

    announce_machine(&node, &ledger, &config, local_ip, token.clone());

    let plane = Arc::new(Plane {
        local_ip,
        router_address: config.router_address.clone(),
        frame_timeout: config.frame_timeout,
        ledger: ledger.clone(),
        peer_table: node.peer_table().clone(),
        manager,
        control: node.stream_control(),
    });

    spawn_inbound(&node, &plane, tun_writer, config.packet_mtu, token.clone())?;

    // Worker pool draining the frame channel.
    let (frames_tx, frames_rx) = mpsc::channel::<Vec<u8>>(config.channel_buffer_size.max(1));
    let frames_rx = Arc::new(Mutex::new(frames_rx));
    for _ in 0..config.concurrency.max(1) {
        let plane = plane.clone();
        let frames_rx = frames_rx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                let frame = {
                    let mut rx = frames_rx.lock().await;
                    tokio::select! {
                        frame = rx.recv() => frame,
                        _ = token.cancelled() => None,
                    }
                };
                let Some(frame) = frame else { return };
                if let Err(e) = handle_frame(&plane, &frame).await {
                    debug!(error = %e, "frame not delivered");
                }
            }
        });
    }

    // Read frames off the device until cancelled.
    let mut buf = vec![0u8; config.packet_mtu.max(64)];
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = tun_reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) => {
                        error!(error = %e, "cannot read frame from the interface");
                        continue;
                    }
                };
                if frames_tx.send(buf[..n].to_vec()).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Advertise our machine record whenever the ledger disagrees. Doubles
/// as ARP and liveness.
fn announce_machine(
    node: &Arc<Node>,
    ledger: &Arc<Ledger>,
    config: &VpnConfig,
    local_ip: IpAddr,
    token: CancellationToken,
) {
    let peer_id = node.peer_id().to_string();
    let address = local_ip.to_string();
    ledger.announce(token, config.announce_interval, move |ledger| {
        let current: Option<Machine> = ledger
            .get_key(bucket::MACHINES, &address)
            .and_then(|d| d.decode().ok());
        if current.map(|m| m.peer_id == peer_id).unwrap_or(false) {
            return;
        }
        let machine = Machine {
            peer_id: peer_id.clone(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            address: address.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        ledger.add(bucket::MACHINES, [(address.clone(), Data::encode(&machine))]);
    });
}

/// Accept inbound packet streams: peers without a machine record (or
/// a static table entry) are reset, everyone else is copied to the
/// TUN device until EOF.
fn spawn_inbound(
    node: &Arc<Node>,
    plane: &Arc<Plane>,
    tun_writer: Arc<Mutex<tokio::io::WriteHalf<tun::AsyncDevice>>>,
    packet_mtu: usize,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut incoming = node.accept_streams(edgevpn_protocol::EDGEVPN)?;
    let plane = plane.clone();
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => return,
                accepted = futures::StreamExt::next(&mut incoming) => accepted,
            };
            let Some((peer, mut stream)) = accepted else { return };
            if !allowed(&plane.ledger, &plane.peer_table, &peer) {
                debug!(peer = %peer, "resetting stream, peer has no machine record");
                continue; // dropping the stream resets it
            }
            let tun_writer = tun_writer.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; packet_mtu.max(64)];
                loop {
                    let read = tokio::select! {
                        _ = token.cancelled() => return,
                        read = stream.read(&mut buf) => read,
                    };
                    match read {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if tun_writer.lock().await.write_all(&buf[..n]).await.is_err() {
                                debug!(peer = %peer, "TUN write failed, dropping frame");
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    Ok(())
}

/// Whether the remote peer may inject packets: it needs a machine
/// record, or an entry in the static peer table when one is set.
fn allowed(ledger: &Ledger, peer_table: &BTreeMap<String, PeerId>, peer: &PeerId) -> bool {
    if !peer_table.is_empty() {
        return peer_table.values().any(|p| p == peer);
    }
    let id = peer.to_string();
    ledger.exists(bucket::MACHINES, |d| {
        d.decode::<Machine>()
            .map(|m| m.peer_id == id)
            .unwrap_or(false)
    })
}

/// Deliver one frame: parse, route, resolve, write.
async fn handle_frame(plane: &Plane, frame: &[u8]) -> anyhow::Result<()> {
    let (src, dst) =
        parse_ips(frame).context("cannot parse an IP header out of the frame")?;
    let dst = route_destination(
        &plane.router_address,
        plane.local_ip,
        &plane.ledger,
        src,
        dst,
    );
    let peer = resolve_destination(&plane.peer_table, &plane.ledger, &dst)?;

    // Prefer a cached idle stream; on write failure evict and redial.
    if let Some(manager) = &plane.manager {
        if let Some((id, stream)) = manager.stream_for(&peer) {
            if stream.lock().await.write_all(frame).await.is_ok() {
                return Ok(());
            }
            manager.disconnected(&peer, id);
        }
    }

    let mut control = plane.control.clone();
    let stream = tokio::time::timeout(
        plane.frame_timeout,
        control.open_stream(peer, edgevpn_protocol::EDGEVPN),
    )
    .await
    .map_err(|_| anyhow::anyhow!("timed out opening a stream to {peer}"))?
    .map_err(|e| anyhow::anyhow!("cannot open a stream to {peer}: {e}"))?;

    match &plane.manager {
        Some(manager) => {
            let shared: SharedStream = Arc::new(Mutex::new(stream));
            manager.connected(peer, shared.clone());
            shared.lock().await.write_all(frame).await?;
        }
        None => {
            let mut stream = stream;
            stream.write_all(frame).await?;
            stream.close().await.ok();
        }
    }
    Ok(())
}

/// Substitute the router for destinations the ledger does not know,
/// but only for locally originated packets.
fn route_destination(
    router_address: &str,
    local_ip: IpAddr,
    ledger: &Ledger,
    src: IpAddr,
    dst: IpAddr,
) -> String {
    let dst = dst.to_string();
    if !router_address.is_empty()
        && src == local_ip
        && ledger.get_key(bucket::MACHINES, &dst).is_none()
    {
        return router_address.to_string();
    }
    dst
}

/// Look the destination up in the static table or the machines bucket.
fn resolve_destination(
    peer_table: &BTreeMap<String, PeerId>,
    ledger: &Ledger,
    dst: &str,
) -> anyhow::Result<PeerId> {
    if !peer_table.is_empty() {
        return peer_table
            .get(dst)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("{dst} not found in the routing table"));
    }
    let value = ledger
        .get_key(bucket::MACHINES, dst)
        .ok_or_else(|| anyhow::anyhow!("{dst} not found in the routing table"))?;
    let machine: Machine = value
        .decode()
        .map_err(|e| anyhow::anyhow!("corrupt machine record for {dst}: {e}"))?;
    machine
        .peer_id
        .parse()
        .map_err(|e| anyhow::anyhow!("cannot decode peer id for {dst}: {e}"))
}

/// Source and destination of an IPv4 frame, falling back to IPv6.
fn parse_ips(frame: &[u8]) -> Option<(IpAddr, IpAddr)> {
    if let Ok(header) = etherparse::Ipv4HeaderSlice::from_slice(frame) {
        return Some((
            IpAddr::V4(header.source_addr()),
            IpAddr::V4(header.destination_addr()),
        ));
    }
    let header = etherparse::Ipv6HeaderSlice::from_slice(frame).ok()?;
    Some((
        IpAddr::V6(header.source_addr()),
        IpAddr::V6(header.destination_addr()),
    ))
}
