//! The edgevpn node binary: join a network from a shared token and
//! bring up the VPN data plane.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use edgevpn_core::token::ConnectionToken;
use edgevpn_node::services::alive;
use edgevpn_node::trustzone::ecdsa::EcdsaProvider;
use edgevpn_node::trustzone::{PeerGater, PeerGuardian};
use edgevpn_node::vpn::{self, dhcp, VpnConfig};
use edgevpn_node::{Gater, Node, NodeConfig, StoreConfig};

const ALIVE_ANNOUNCE: Duration = Duration::from_secs(20);
const ALIVE_SCRUB: Duration = Duration::from_secs(600);
const ALIVE_MAX: Duration = Duration::from_secs(900);
const CHALLENGER_INTERVAL: Duration = Duration::from_secs(20);
const GATER_REFRESH: Duration = Duration::from_secs(10);

struct Cli {
    token: Option<String>,
    config_file: Option<PathBuf>,
    address: String,
    dhcp: bool,
    interface: String,
    router: String,
    listen: Vec<String>,
    bootstrap: Vec<String>,
    enable_mdns: bool,
    enable_dht: bool,
    state_dir: PathBuf,
    persistent_ledger: bool,
    blacklist: Vec<String>,
    concurrency: usize,
    peerguard_key: Option<String>,
    peergater_relaxed: bool,
    autocleanup: bool,
    generate_token: bool,
    generate_keys: bool,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            token: std::env::var("EDGEVPNTOKEN").ok(),
            config_file: None,
            address: "10.1.0.1/24".to_string(),
            dhcp: false,
            interface: "edgevpn0".to_string(),
            router: String::new(),
            listen: vec![],
            bootstrap: vec![],
            enable_mdns: true,
            enable_dht: true,
            state_dir: PathBuf::from("/var/lib/edgevpn"),
            persistent_ledger: false,
            blacklist: vec![],
            concurrency: 1,
            peerguard_key: None,
            peergater_relaxed: true,
            autocleanup: false,
            generate_token: false,
            generate_keys: false,
        }
    }
}

fn parse_args() -> Cli {
    let mut cli = Cli::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--token" | "-t" => cli.token = args.next(),
            "--config" => cli.config_file = args.next().map(PathBuf::from),
            "--address" | "-a" => {
                if let Some(a) = args.next() {
                    cli.address = a;
                }
            }
            "--dhcp" => cli.dhcp = true,
            "--interface" | "-i" => {
                if let Some(i) = args.next() {
                    cli.interface = i;
                }
            }
            "--router" => cli.router = args.next().unwrap_or_default(),
            "--listen" | "-l" => {
                if let Some(l) = args.next() {
                    cli.listen.push(l);
                }
            }
            "--bootstrap" | "-b" => {
                if let Some(b) = args.next() {
                    cli.bootstrap.push(b);
                }
            }
            "--no-mdns" => cli.enable_mdns = false,
            "--no-dht" => cli.enable_dht = false,
            "--state" => {
                if let Some(s) = args.next() {
                    cli.state_dir = PathBuf::from(s);
                }
            }
            "--persistent-ledger" => cli.persistent_ledger = true,
            "--blacklist" => {
                if let Some(b) = args.next() {
                    cli.blacklist.push(b);
                }
            }
            "--concurrency" => {
                cli.concurrency = args
                    .next()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(cli.concurrency);
            }
            "--peerguard-key" => cli.peerguard_key = args.next(),
            "--peergater-strict" => cli.peergater_relaxed = false,
            "--peerguard-autocleanup" => cli.autocleanup = true,
            "--generate-token" => cli.generate_token = true,
            "--generate-keys" => cli.generate_keys = true,
            "--help" | "-h" => {
                eprintln!("edgevpn node");
                eprintln!();
                eprintln!("USAGE:");
                eprintln!("  edgevpn [OPTIONS]");
                eprintln!();
                eprintln!("OPTIONS:");
                eprintln!("  -t, --token <B64>        Connection token (or EDGEVPNTOKEN)");
                eprintln!("      --config <PATH>      Connection token as a YAML file");
                eprintln!("  -a, --address <CIDR>     Static VPN address (default 10.1.0.1/24)");
                eprintln!("      --dhcp               Ask the network for an address instead");
                eprintln!("  -i, --interface <NAME>   TUN device name (default edgevpn0)");
                eprintln!("      --router <IP>        Egress router for unknown destinations");
                eprintln!("  -l, --listen <MADDR>     Listen multiaddr (repeatable)");
                eprintln!("  -b, --bootstrap <MADDR>  Bootstrap peer (repeatable)");
                eprintln!("      --no-mdns            Disable mDNS discovery");
                eprintln!("      --no-dht             Disable DHT discovery");
                eprintln!("      --state <DIR>        State directory (leases, keys, blocks)");
                eprintln!("      --persistent-ledger  Keep adopted blocks on disk");
                eprintln!("      --blacklist <ENTRY>  Peer id or CIDR to refuse (repeatable)");
                eprintln!("      --concurrency <N>    VPN frame workers (default 1)");
                eprintln!("      --peerguard-key <K>  Enable the trust zone with this ECDSA key");
                eprintln!("      --peergater-strict   Gate even while the trust db is empty");
                eprintln!("      --peerguard-autocleanup  Drop trust entries for departed peers");
                eprintln!("      --generate-token     Print a fresh connection token and exit");
                eprintln!("      --generate-keys      Print a fresh ECDSA keypair and exit");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }
    cli
}

fn load_token(cli: &Cli) -> anyhow::Result<ConnectionToken> {
    if let Some(path) = &cli.config_file {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return ConnectionToken::from_yaml(&yaml).context("parsing the connection token");
    }
    let encoded = cli
        .token
        .as_deref()
        .context("no connection token: pass --token, --config or EDGEVPNTOKEN")?;
    ConnectionToken::from_base64(encoded).context("the token is not base64 YAML")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,edgevpn=debug".into()),
        )
        .init();

    let cli = parse_args();

    if cli.generate_token {
        println!("{}", ConnectionToken::generate().to_base64());
        return Ok(());
    }
    if cli.generate_keys {
        let (private, public) = edgevpn_crypto::ecdsa::generate_keys()?;
        println!("private: {private}");
        println!("public:  {public}");
        return Ok(());
    }

    let token = load_token(&cli)?;
    let exchange_key = token.otp.crypto.key.clone();

    let gater = cli
        .peerguard_key
        .is_some()
        .then(|| PeerGater::new(cli.peergater_relaxed));

    // Never dial peers across the VPN subnet itself, that would loop
    // transport traffic back through the tunnel.
    let mut blacklist = cli.blacklist.clone();
    if !cli.dhcp {
        if let Ok(net) = cli.address.parse::<ipnet::IpNet>() {
            blacklist.push(net.trunc().to_string());
        }
    }

    let config = NodeConfig {
        token: Some(token),
        listen_addrs: cli
            .listen
            .iter()
            .map(|a| a.parse())
            .collect::<Result<_, _>>()
            .context("invalid listen address")?,
        bootstrap_peers: cli
            .bootstrap
            .iter()
            .map(|a| a.parse())
            .collect::<Result<_, _>>()
            .context("invalid bootstrap address")?,
        enable_dht: cli.enable_dht,
        enable_mdns: cli.enable_mdns,
        store: if cli.persistent_ledger {
            StoreConfig::Disk(cli.state_dir.join("blocks"))
        } else {
            StoreConfig::Memory
        },
        key_cache: Some(cli.state_dir.join("privkey")),
        blacklist,
        gater: gater.clone().map(|g| g as Arc<dyn Gater>),
        ..NodeConfig::default()
    };

    let node = Node::new(config)?;
    let ledger = node.ledger();
    let root = CancellationToken::new();

    if let Some(key) = &cli.peerguard_key {
        let guardian = PeerGuardian::new(vec![EcdsaProvider::new(key.clone())]);
        node.add_public_handler(guardian.handler(root.clone()));
        guardian.start_challenger(
            root.clone(),
            CHALLENGER_INTERVAL,
            cli.autocleanup,
            node.clone(),
            ledger.clone(),
        );
    }
    if let Some(gater) = &gater {
        gater.start_updater(&ledger, root.clone(), GATER_REFRESH);
    }

    node.start(root.clone()).await?;
    alive::start(
        &node,
        &ledger,
        root.clone(),
        ALIVE_ANNOUNCE,
        ALIVE_SCRUB,
        ALIVE_MAX,
    );

    let interface_address = if cli.dhcp {
        let dhcp_config = dhcp::DhcpConfig {
            lease_dir: cli.state_dir.join("leases"),
            base_address: base_of(&cli.address),
            max_time: ALIVE_MAX,
        };
        let ip = dhcp::acquire(&node, &ledger, root.clone(), &dhcp_config, &exchange_key).await?;
        // The subnet was unknown when the swarm was built; register
        // the block now, before the TUN opens.
        let subnet: ipnet::IpNet = format!("{ip}/24")
            .parse()
            .context("assigned address is not a valid subnet")?;
        node.block_subnet(subnet.trunc()).await?;
        format!("{ip}/24")
    } else {
        cli.address.clone()
    };

    info!(address = %interface_address, "bringing the VPN up");
    let vpn_config = VpnConfig {
        interface_name: cli.interface.clone(),
        interface_address,
        router_address: cli.router.clone(),
        concurrency: cli.concurrency,
        ..VpnConfig::default()
    };
    vpn::start(vpn_config, node, ledger, root).await
}

/// Strip the prefix length off a CIDR, for the DHCP base address.
fn base_of(cidr: &str) -> String {
    cidr.split('/').next().unwrap_or(cidr).to_string()
}
