//! Ledger-resident record types. Field names are pinned to the wire
//! (JSON inside `Data` values), so renames here are protocol changes.

use serde::{Deserialize, Serialize};

/// One VPN participant: the row in the `machines` bucket acting as
/// both ARP entry and liveness advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "Arch")]
    pub arch: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Version")]
    pub version: String,
}

/// A consumer of a published service, listed in the `users` bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

/// A published TCP service, listed in the `services` bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    #[serde(rename = "Name")]
    pub name: String,
}
