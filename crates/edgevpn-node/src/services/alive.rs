//! Liveness beacons. Every node periodically stamps
//! `healthcheck/<peer_id>` with the current UTC time; the alive set is
//! everyone stamped within `max_time`. After `scrub_time` the FNV
//! leader among the alive nodes deletes the whole bucket so departed
//! peers do not accumulate forever.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use edgevpn_core::utils::leader;
use edgevpn_core::{Data, Ledger};
use edgevpn_protocol::bucket;

use crate::node::Node;

/// Start the liveness announce loop.
pub fn start(
    node: &Arc<Node>,
    ledger: &Arc<Ledger>,
    token: CancellationToken,
    announce_time: Duration,
    scrub_time: Duration,
    max_time: Duration,
) {
    let peer_id = node.peer_id().to_string();
    let started = Mutex::new(Utc::now());
    ledger.announce(token, announce_time, move |ledger| {
        ledger.add(
            bucket::HEALTHCHECK,
            [(
                peer_id.clone(),
                Data::encode(&Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            )],
        );

        let nodes = available_nodes(ledger, max_time);
        if nodes.is_empty() {
            return;
        }
        let mut last_scrub = started.lock().unwrap();
        if Utc::now() < *last_scrub + chrono::Duration::from_std(scrub_time).unwrap_or_default()
        {
            return;
        }
        // Reset the timer on every node so non-leaders do not retry
        // the delete one tick later.
        *last_scrub = Utc::now();
        if leader(&nodes) == Some(peer_id.as_str()) {
            ledger.delete_bucket(bucket::HEALTHCHECK);
        }
    });
}

/// Peers whose healthcheck stamp is within `max_time`.
pub fn available_nodes(ledger: &Ledger, max_time: Duration) -> Vec<String> {
    let max = chrono::Duration::from_std(max_time).unwrap_or_default();
    let now = Utc::now();
    ledger
        .current_data()
        .get(bucket::HEALTHCHECK)
        .map(|kv| {
            kv.iter()
                .filter_map(|(peer, stamp)| {
                    let stamp: String = stamp.decode().ok()?;
                    let parsed: DateTime<Utc> =
                        DateTime::parse_from_rfc3339(&stamp).ok()?.with_timezone(&Utc);
                    (parsed + max > now).then(|| peer.clone())
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgevpn_core::MemoryStore;
    use tokio::sync::mpsc;

    fn ledger() -> Arc<Ledger> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Ledger::new(tx, Box::new(MemoryStore::new()))
    }

    fn stamp(ledger: &Ledger, peer: &str, when: DateTime<Utc>) {
        ledger.add(
            bucket::HEALTHCHECK,
            [(
                peer.to_string(),
                Data::encode(&when.to_rfc3339_opts(SecondsFormat::Secs, true)),
            )],
        );
    }

    #[test]
    fn fresh_stamps_count_as_alive() {
        let ledger = ledger();
        stamp(&ledger, "peer-a", Utc::now());
        let nodes = available_nodes(&ledger, Duration::from_secs(60));
        assert_eq!(nodes, vec!["peer-a".to_string()]);
    }

    #[test]
    fn stale_stamps_drop_out() {
        let ledger = ledger();
        stamp(&ledger, "gone", Utc::now() - chrono::Duration::minutes(10));
        stamp(&ledger, "here", Utc::now());
        let nodes = available_nodes(&ledger, Duration::from_secs(60));
        assert_eq!(nodes, vec!["here".to_string()]);
    }

    #[test]
    fn unparseable_stamps_are_ignored() {
        let ledger = ledger();
        ledger.add(
            bucket::HEALTHCHECK,
            [("bad".to_string(), Data::encode(&"not a time"))],
        );
        assert!(available_nodes(&ledger, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn empty_ledger_has_no_alive_nodes() {
        assert!(available_nodes(&ledger(), Duration::from_secs(60)).is_empty());
    }
}
