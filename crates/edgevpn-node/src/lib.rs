//! The overlay node: wires the gossip transport, the sealed event
//! loop, the ledger and the services (trust zone, VPN, alive) into a
//! running process.

pub mod config;
pub mod node;
pub mod services;
pub mod trustzone;
pub mod vpn;

pub use config::{NodeConfig, StoreConfig};
pub use node::{Gater, Handler, Inbound, Node};
