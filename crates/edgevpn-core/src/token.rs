//! The connection token: everything two strangers need to find each
//! other and share a ledger, as YAML or base64-of-YAML.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::utils::rand_string;

const DEFAULT_KEY_LENGTH: usize = 43;
const DEFAULT_INTERVAL: u32 = 9000;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 20 << 20;

/// One rotating-secret configuration: the shared key, the rotation
/// window in seconds and the derived-key length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpConfig {
    pub interval: u32,
    pub key: String,
    pub length: u32,
}

/// The two rotating secrets: `dht` drives the discovery rendezvous,
/// `crypto` drives the symmetric sealing key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Otp {
    pub dht: OtpConfig,
    pub crypto: OtpConfig,
}

/// The connection token shared out-of-band between peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionToken {
    pub otp: Otp,
    pub room: String,
    pub rendezvous: String,
    pub mdns: String,
    pub max_message_size: usize,
}

impl ConnectionToken {
    /// A fresh token with random secrets.
    pub fn generate() -> ConnectionToken {
        ConnectionToken {
            room: rand_string(DEFAULT_KEY_LENGTH),
            rendezvous: rand_string(DEFAULT_KEY_LENGTH),
            mdns: rand_string(DEFAULT_KEY_LENGTH),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            otp: Otp {
                dht: OtpConfig {
                    key: rand_string(DEFAULT_KEY_LENGTH),
                    interval: DEFAULT_INTERVAL,
                    length: DEFAULT_KEY_LENGTH as u32,
                },
                crypto: OtpConfig {
                    key: rand_string(DEFAULT_KEY_LENGTH),
                    interval: DEFAULT_INTERVAL,
                    length: DEFAULT_KEY_LENGTH as u32,
                },
            },
        }
    }

    pub fn from_yaml(s: &str) -> Result<ConnectionToken, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }

    pub fn from_base64(s: &str) -> Option<ConnectionToken> {
        let bytes = BASE64.decode(s.trim()).ok()?;
        serde_yaml::from_slice(&bytes).ok()
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_yaml())
    }
}
