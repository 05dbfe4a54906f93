//! Rendezvous discovery over the Kademlia DHT. The rendezvous string
//! rotates with its own secret; a two-slot ring keeps the previous
//! window announced so peers straddling a boundary still find each
//! other.

use edgevpn_crypto::{md5_hex, otp};
use libp2p::kad::RecordKey;
use sha2::{Digest, Sha256};

/// Fixed-size history of recent rendezvous strings, newest last.
#[derive(Debug, Clone, Default)]
pub struct Ring {
    data: Vec<String>,
    length: usize,
}

impl Ring {
    pub fn new(length: usize) -> Ring {
        Ring {
            data: Vec::new(),
            length,
        }
    }

    /// Append unless it repeats the newest entry, evicting the oldest
    /// past capacity.
    pub fn add(&mut self, s: String) {
        if self.data.last() == Some(&s) {
            return;
        }
        if self.data.len() + 1 > self.length {
            self.data.remove(0);
        }
        self.data.push(s);
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.data.iter().map(|s| s.as_str())
    }
}

/// Rotating rendezvous derivation for the DHT.
#[derive(Debug, Clone)]
pub struct DhtRendezvous {
    otp_key: String,
    key_length: usize,
    interval: u64,
    fallback: String,
    history: Ring,
}

impl DhtRendezvous {
    pub fn new(
        otp_key: impl Into<String>,
        key_length: usize,
        interval: u64,
        fallback: impl Into<String>,
    ) -> DhtRendezvous {
        DhtRendezvous {
            otp_key: otp_key.into(),
            key_length: if key_length == 0 { 12 } else { key_length },
            interval,
            fallback: fallback.into(),
            history: Ring::new(2),
        }
    }

    /// The rendezvous string for the current window, or the static
    /// fallback when no rotating secret is configured.
    pub fn rendezvous(&self) -> String {
        if self.otp_key.is_empty() {
            return self.fallback.clone();
        }
        md5_hex(&otp::totp_now(&self.otp_key, self.key_length, self.interval))
    }

    /// Record the current rendezvous and return every string that
    /// should be announced this round (current plus previous window).
    pub fn announce_set(&mut self) -> Vec<String> {
        let current = self.rendezvous();
        self.history.add(current);
        self.history.iter().map(str::to_string).collect()
    }

    /// The DHT provider key for a rendezvous string.
    pub fn record_key(rendezvous: &str) -> RecordKey {
        let mut hasher = Sha256::new();
        hasher.update(rendezvous.as_bytes());
        RecordKey::new(&hasher.finalize().as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_deduplicates_the_newest_entry() {
        let mut ring = Ring::new(2);
        ring.add("a".into());
        ring.add("a".into());
        assert_eq!(ring.iter().count(), 1);
    }

    #[test]
    fn ring_evicts_the_oldest() {
        let mut ring = Ring::new(2);
        ring.add("a".into());
        ring.add("b".into());
        ring.add("c".into());
        let entries: Vec<_> = ring.iter().collect();
        assert_eq!(entries, vec!["b", "c"]);
    }

    #[test]
    fn static_fallback_when_no_secret() {
        let d = DhtRendezvous::new("", 12, 120, "meetingpoint");
        assert_eq!(d.rendezvous(), "meetingpoint");
    }

    #[test]
    fn rotating_rendezvous_is_a_hex_md5() {
        let d = DhtRendezvous::new("secret", 12, 120, "");
        let rv = d.rendezvous();
        assert_eq!(rv.len(), 32);
        assert!(rv.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn announce_set_holds_at_most_two_windows() {
        let mut d = DhtRendezvous::new("secret", 12, 120, "");
        // Same window twice stays a single entry.
        assert_eq!(d.announce_set().len(), 1);
        assert_eq!(d.announce_set().len(), 1);
        // Fake a previous window by seeding the history.
        d.history.add("previous-window".into());
        assert_eq!(d.announce_set().len(), 2);
    }

    #[test]
    fn record_keys_are_stable() {
        assert_eq!(
            DhtRendezvous::record_key("rv"),
            DhtRendezvous::record_key("rv")
        );
        assert_ne!(
            DhtRendezvous::record_key("rv"),
            DhtRendezvous::record_key("other")
        );
    }
}
