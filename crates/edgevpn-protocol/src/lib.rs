//! Protocol identifiers and reserved ledger bucket names. Every
//! consumer of the overlay shares these constants; changing one is a
//! network-wide breaking change.

use libp2p::StreamProtocol;

/// L3 packet transport: raw frames, one writer per stream.
pub const EDGEVPN: StreamProtocol = StreamProtocol::new("/edgevpn/0.1");
/// TCP bytestream proxy: both halves copied until EOF.
pub const SERVICE: StreamProtocol = StreamProtocol::new("/edgevpn/service/0.1");
/// File transfer: server streams file bytes until EOF.
pub const FILE: StreamProtocol = StreamProtocol::new("/edgevpn/file/0.1");
/// HTTP egress: request/response proxied over the stream.
pub const EGRESS: StreamProtocol = StreamProtocol::new("/edgevpn/egress/0.1");

/// Reserved ledger buckets.
pub mod bucket {
    pub const FILES: &str = "files";
    pub const MACHINES: &str = "machines";
    pub const SERVICES: &str = "services";
    pub const USERS: &str = "users";
    pub const HEALTHCHECK: &str = "healthcheck";
    pub const DNS: &str = "dns";
    pub const EGRESS: &str = "egress";
    pub const TRUSTZONE: &str = "trustzone";
    pub const TRUSTZONE_AUTH: &str = "trustzoneAuth";
    pub const DHCP: &str = "dhcp";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_ids_are_pinned() {
        assert_eq!(EDGEVPN.as_ref(), "/edgevpn/0.1");
        assert_eq!(SERVICE.as_ref(), "/edgevpn/service/0.1");
        assert_eq!(FILE.as_ref(), "/edgevpn/file/0.1");
        assert_eq!(EGRESS.as_ref(), "/edgevpn/egress/0.1");
    }
}
