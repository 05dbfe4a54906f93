//! Small pure helpers shared by the DHCP and alive services.

use std::net::Ipv4Addr;

use rand::Rng;

/// FNV-32a over the peer ID string.
fn fnv32a(s: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in s.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Deterministic leader among the given peers: the one whose FNV-32a
/// hash is the maximum. Every node computes the same answer from the
/// same alive set, which is all the coordination the DHCP assigner
/// and the healthcheck scrubber need.
pub fn leader(actives: &[String]) -> Option<&str> {
    actives
        .iter()
        .max_by_key(|a| (fnv32a(a), std::cmp::Reverse(a.as_str())))
        .map(|s| s.as_str())
}

/// The next free address: one past the numerically highest used
/// address, or the base address when nothing is in use yet.
pub fn next_ip(base: &str, used: &[String]) -> Option<String> {
    let base: Ipv4Addr = base.parse().ok()?;
    let highest = used
        .iter()
        .filter_map(|s| s.parse::<Ipv4Addr>().ok())
        .max();
    match highest {
        Some(ip) => {
            let next = u32::from(ip).checked_add(1)?;
            Some(Ipv4Addr::from(next).to_string())
        }
        None => Some(base.to_string()),
    }
}

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random alphanumeric secret of the given length.
pub fn rand_string(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv32a_matches_reference_vectors() {
        assert_eq!(fnv32a(""), 0x811c9dc5);
        assert_eq!(fnv32a("a"), 0xe40c292c);
        assert_eq!(fnv32a("foobar"), 0xbf9cf968);
    }

    #[test]
    fn leader_is_stable_and_order_independent() {
        let mut peers = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        let first = leader(&peers).unwrap().to_string();
        peers.reverse();
        assert_eq!(leader(&peers).unwrap(), first);
    }

    #[test]
    fn leader_of_empty_set_is_none() {
        assert!(leader(&[]).is_none());
    }

    #[test]
    fn next_ip_increments_the_highest_used() {
        let used = vec!["10.1.0.1".to_string(), "10.1.0.5".to_string()];
        assert_eq!(next_ip("10.1.0.1", &used).unwrap(), "10.1.0.6");
    }

    #[test]
    fn next_ip_defaults_to_the_base() {
        assert_eq!(next_ip("10.1.1.0", &[]).unwrap(), "10.1.1.0");
    }

    #[test]
    fn next_ip_ignores_garbage_entries() {
        let used = vec!["not-an-ip".to_string(), "10.1.0.2".to_string()];
        assert_eq!(next_ip("10.1.0.1", &used).unwrap(), "10.1.0.3");
    }

    #[test]
    fn rand_string_has_the_requested_length() {
        assert_eq!(rand_string(43).len(), 43);
        assert_ne!(rand_string(43), rand_string(43));
    }
}
