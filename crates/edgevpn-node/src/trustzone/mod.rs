//! Admission control over an open bus. The ledger is readable by
//! anyone holding the shared secret; the trust zone restricts which
//! senders' messages are acted upon while the public channel stays
//! open for authentication traffic.

pub mod ecdsa;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libp2p::PeerId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use edgevpn_core::ticker::BackoffTicker;
use edgevpn_core::{Data, Ledger};
use edgevpn_protocol::bucket;

use crate::node::{Gater, Handler, Inbound, Node};

const ADMIT_INTERVAL: Duration = Duration::from_secs(5);
const ADMIT_TIMEOUT: Duration = Duration::from_secs(120);

struct GaterState {
    enabled: bool,
    trust_db: Vec<PeerId>,
}

/// Drops private-channel messages from peers outside the trust db.
/// In relaxed mode an empty db gates nothing, which lets a fresh
/// network bootstrap before the first admission.
pub struct PeerGater {
    relaxed: bool,
    state: Mutex<GaterState>,
}

impl PeerGater {
    pub fn new(relaxed: bool) -> Arc<PeerGater> {
        Arc::new(PeerGater {
            relaxed,
            state: Mutex::new(GaterState {
                enabled: true,
                trust_db: Vec::new(),
            }),
        })
    }

    /// Mirror the ledger's trustzone bucket into the trust db on a
    /// reconcile loop. The db is advisory and lags the ledger by at
    /// most one interval.
    pub fn start_updater(
        self: &Arc<Self>,
        ledger: &Arc<Ledger>,
        token: CancellationToken,
        interval: Duration,
    ) {
        let gater = self.clone();
        ledger.announce(token, interval, move |ledger| {
            let db: Vec<PeerId> = ledger
                .current_data()
                .get(bucket::TRUSTZONE)
                .map(|kv| kv.keys().filter_map(|k| k.parse().ok()).collect())
                .unwrap_or_default();
            gater.state.lock().unwrap().trust_db = db;
        });
    }

    #[cfg(test)]
    fn set_trust_db(&self, db: Vec<PeerId>) {
        self.state.lock().unwrap().trust_db = db;
    }
}

impl Gater for PeerGater {
    fn gate(&self, peer: &PeerId) -> bool {
        let state = self.state.lock().unwrap();
        if !state.enabled {
            return false;
        }
        if self.relaxed && state.trust_db.is_empty() {
            return false;
        }
        !state.trust_db.contains(peer)
    }

    fn enable(&self) {
        self.state.lock().unwrap().enabled = true;
    }

    fn disable(&self) {
        self.state.lock().unwrap().enabled = false;
    }

    fn enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }
}

/// One authentication scheme. `authenticate` inspects a public-channel
/// message against the auth data stored in the ledger; `challenger`
/// runs periodically and is expected to publish whatever gets this
/// node admitted.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, message: &Inbound, trust_data: &BTreeMap<String, Data>) -> bool;
    fn challenger(&self, in_trustzone: bool, node: &Node, ledger: &Arc<Ledger>);
}

/// Listens on the public channel and admits peers whose messages
/// satisfy any provider.
pub struct PeerGuardian {
    providers: Vec<Arc<dyn AuthProvider>>,
}

impl PeerGuardian {
    pub fn new(providers: Vec<Arc<dyn AuthProvider>>) -> Arc<PeerGuardian> {
        Arc::new(PeerGuardian { providers })
    }

    /// The public-channel handler. A sender not yet in the trust zone
    /// that passes any provider is admitted with a reconciling write;
    /// admission is idempotent, so two nodes admitting the same peer
    /// concurrently is fine.
    pub fn handler(self: &Arc<Self>, token: CancellationToken) -> Handler {
        let guardian = self.clone();
        Arc::new(move |ledger, inbound| {
            debug!(peer = %inbound.sender, "guardian received public message");
            let trust_data = ledger
                .current_data()
                .get(bucket::TRUSTZONE_AUTH)
                .cloned()
                .unwrap_or_default();
            let sender = inbound.sender.to_string();
            for provider in &guardian.providers {
                if ledger.get_key(bucket::TRUSTZONE, &sender).is_none()
                    && provider.authenticate(inbound, &trust_data)
                {
                    ledger.persist(
                        token.clone(),
                        ADMIT_INTERVAL,
                        ADMIT_TIMEOUT,
                        bucket::TRUSTZONE,
                        &sender,
                        Data::encode(&""),
                    );
                    return Ok(());
                }
            }
            Ok(())
        })
    }

    /// Periodically run every provider's challenger until this node is
    /// in the trust zone, and optionally clean up entries for peers
    /// that left the gossip mesh.
    pub fn start_challenger(
        self: &Arc<Self>,
        token: CancellationToken,
        interval: Duration,
        autocleanup: bool,
        node: Arc<Node>,
        ledger: Arc<Ledger>,
    ) {
        let guardian = self.clone();
        tokio::spawn(async move {
            let mut ticker = BackoffTicker::capped(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let in_tz = ledger
                    .get_key(bucket::TRUSTZONE, &node.peer_id().to_string())
                    .is_some();
                for provider in &guardian.providers {
                    provider.challenger(in_tz, &node, &ledger);
                }

                if autocleanup {
                    guardian.cleanup_departed(&node, &ledger).await;
                }
            }
        });
    }

    /// Tombstone trust-zone entries whose peer is no longer in the
    /// gossip peer list.
    async fn cleanup_departed(&self, node: &Node, ledger: &Arc<Ledger>) {
        let peers = match node.list_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "cannot list peers for trust-zone cleanup");
                return;
            }
        };
        let tz = ledger
            .current_data()
            .get(bucket::TRUSTZONE)
            .cloned()
            .unwrap_or_default();
        for entry in tz.keys() {
            if !peers.iter().any(|p| p.to_string() == *entry) {
                ledger.delete(bucket::TRUSTZONE, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgevpn_core::MemoryStore;
    use edgevpn_network::Annotations;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    // Broadcasts go nowhere; local chain mutation is all these tests
    // need.
    fn ledger() -> Arc<Ledger> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Ledger::new(tx, Box::new(MemoryStore::new()))
    }

    #[test]
    fn disabled_gater_gates_nothing() {
        let gater = PeerGater::new(false);
        gater.disable();
        assert!(!gater.gate(&PeerId::random()));
        assert!(!gater.enabled());
    }

    #[test]
    fn strict_gater_drops_unknown_peers() {
        let gater = PeerGater::new(false);
        let trusted = PeerId::random();
        gater.set_trust_db(vec![trusted]);
        assert!(!gater.gate(&trusted));
        assert!(gater.gate(&PeerId::random()));
    }

    #[test]
    fn strict_gater_with_empty_db_gates_everyone() {
        let gater = PeerGater::new(false);
        assert!(gater.gate(&PeerId::random()));
    }

    #[test]
    fn relaxed_gater_lets_everything_through_until_first_admission() {
        let gater = PeerGater::new(true);
        let peer = PeerId::random();
        assert!(!gater.gate(&peer));
        gater.set_trust_db(vec![PeerId::random()]);
        assert!(gater.gate(&peer));
    }

    #[tokio::test(start_paused = true)]
    async fn updater_mirrors_the_trustzone_bucket() {
        let ledger = ledger();
        let gater = PeerGater::new(false);
        let admitted = PeerId::random();
        ledger.add(
            bucket::TRUSTZONE,
            [(admitted.to_string(), Data::encode(&""))],
        );

        let token = CancellationToken::new();
        gater.start_updater(&ledger, token.clone(), Duration::from_secs(1));
        sleep(Duration::from_secs(10)).await;
        token.cancel();

        assert!(!gater.gate(&admitted));
        assert!(gater.gate(&PeerId::random()));
    }

    struct AcceptAll;
    impl AuthProvider for AcceptAll {
        fn authenticate(&self, _m: &Inbound, _t: &BTreeMap<String, Data>) -> bool {
            true
        }
        fn challenger(&self, _in_tz: bool, _node: &Node, _ledger: &Arc<Ledger>) {}
    }

    struct RejectAll;
    impl AuthProvider for RejectAll {
        fn authenticate(&self, _m: &Inbound, _t: &BTreeMap<String, Data>) -> bool {
            false
        }
        fn challenger(&self, _in_tz: bool, _node: &Node, _ledger: &Arc<Ledger>) {}
    }

    fn inbound(sender: PeerId) -> Inbound {
        Inbound {
            payload: b"challenge".to_vec(),
            sender,
            annotations: Some(Annotations::signed("sig")),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn guardian_admits_an_authenticated_sender() {
        let ledger = ledger();
        let guardian = PeerGuardian::new(vec![Arc::new(AcceptAll)]);
        let token = CancellationToken::new();
        let handler = guardian.handler(token.clone());

        let sender = PeerId::random();
        handler(&ledger, &inbound(sender)).unwrap();
        sleep(Duration::from_secs(30)).await;
        token.cancel();

        assert!(ledger
            .get_key(bucket::TRUSTZONE, &sender.to_string())
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn guardian_ignores_unauthenticated_senders() {
        let ledger = ledger();
        let guardian = PeerGuardian::new(vec![Arc::new(RejectAll)]);
        let token = CancellationToken::new();
        let handler = guardian.handler(token.clone());

        let sender = PeerId::random();
        handler(&ledger, &inbound(sender)).unwrap();
        sleep(Duration::from_secs(30)).await;
        token.cancel();

        assert!(ledger
            .get_key(bucket::TRUSTZONE, &sender.to_string())
            .is_none());
    }
}
