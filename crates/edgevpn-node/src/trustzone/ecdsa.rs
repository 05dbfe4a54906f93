//! The ECDSA-P521 authentication provider. A node outside the trust
//! zone signs the literal payload `challenge` with its private key and
//! publishes it on the public channel; members verify the signature
//! against every `ecdsa*` public key stored in the trustzoneAuth
//! bucket and admit the sender on the first match.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error};

use edgevpn_core::{Data, Ledger};
use edgevpn_crypto::ecdsa;
use edgevpn_network::{Annotations, Message};

use crate::node::{Inbound, Node};
use crate::trustzone::AuthProvider;

const CHALLENGE: &str = "challenge";

/// Provider holding this node's encoded private key. Public keys are
/// provisioned out-of-band into `trustzoneAuth/ecdsa*` entries.
pub struct EcdsaProvider {
    private_key: String,
}

impl EcdsaProvider {
    pub fn new(private_key: impl Into<String>) -> Arc<EcdsaProvider> {
        Arc::new(EcdsaProvider {
            private_key: private_key.into(),
        })
    }
}

impl AuthProvider for EcdsaProvider {
    fn authenticate(&self, message: &Inbound, trust_data: &BTreeMap<String, Data>) -> bool {
        let Some(sigs) = message.annotations.as_ref().and_then(|a| a.sigs.as_deref()) else {
            debug!(peer = %message.sender, "message carries no signature");
            return false;
        };

        let public_keys: Vec<String> = trust_data
            .iter()
            .filter(|(key, _)| key.contains("ecdsa"))
            .filter_map(|(_, value)| value.decode::<String>().ok())
            .collect();
        if public_keys.is_empty() {
            debug!("no ecdsa public keys in the ledger to authenticate against");
            return false;
        }

        public_keys.iter().any(|public_key| {
            match ecdsa::verify(public_key, sigs, &message.payload) {
                Ok(()) => {
                    debug!(peer = %message.sender, "signature verified");
                    true
                }
                Err(_) => false,
            }
        })
    }

    fn challenger(&self, in_trustzone: bool, node: &Node, _ledger: &Arc<Ledger>) {
        if in_trustzone {
            return;
        }
        debug!("not in the trust zone yet, sending a challenge");
        let signature = match ecdsa::sign(&self.private_key, CHALLENGE.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "cannot sign the challenge");
                return;
            }
        };
        let message = Message::new(CHALLENGE).with_annotations(Annotations::signed(signature));
        if let Err(e) = node.publish_message(message) {
            debug!(error = %e, "challenge not published");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    fn signed_challenge(private_key: &str) -> Inbound {
        let signature = ecdsa::sign(private_key, CHALLENGE.as_bytes()).unwrap();
        Inbound {
            payload: CHALLENGE.as_bytes().to_vec(),
            sender: PeerId::random(),
            annotations: Some(Annotations::signed(signature)),
        }
    }

    fn trust_data(entries: &[(&str, &str)]) -> BTreeMap<String, Data> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Data::encode(v)))
            .collect()
    }

    #[test]
    fn matching_key_authenticates() {
        let (private, public) = ecdsa::generate_keys().unwrap();
        let provider = EcdsaProvider::new(private.clone());
        let message = signed_challenge(&private);
        assert!(provider.authenticate(&message, &trust_data(&[("ecdsa_1", &public)])));
    }

    #[test]
    fn any_of_several_keys_suffices() {
        let (private, public) = ecdsa::generate_keys().unwrap();
        let (_, other_public) = ecdsa::generate_keys().unwrap();
        let provider = EcdsaProvider::new(private.clone());
        let message = signed_challenge(&private);
        assert!(provider.authenticate(
            &message,
            &trust_data(&[("ecdsa_1", &other_public), ("ecdsa_2", &public)])
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let (private, _) = ecdsa::generate_keys().unwrap();
        let (_, unrelated_public) = ecdsa::generate_keys().unwrap();
        let provider = EcdsaProvider::new(private.clone());
        let message = signed_challenge(&private);
        assert!(!provider.authenticate(&message, &trust_data(&[("ecdsa", &unrelated_public)])));
    }

    #[test]
    fn non_ecdsa_entries_are_ignored() {
        let (private, public) = ecdsa::generate_keys().unwrap();
        let provider = EcdsaProvider::new(private.clone());
        let message = signed_challenge(&private);
        assert!(!provider.authenticate(&message, &trust_data(&[("psk", &public)])));
    }

    #[test]
    fn unsigned_messages_fail() {
        let (private, public) = ecdsa::generate_keys().unwrap();
        let provider = EcdsaProvider::new(private);
        let message = Inbound {
            payload: CHALLENGE.as_bytes().to_vec(),
            sender: PeerId::random(),
            annotations: None,
        };
        assert!(!provider.authenticate(&message, &trust_data(&[("ecdsa", &public)])));
    }
}
