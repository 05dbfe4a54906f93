//! Time-based one-time derivation. Topic names, the discovery
//! rendezvous and the sealing key are all `md5(totp(secret))` over
//! their own secret, so the identifier of every channel rotates with
//! the window and a single leaked window stays contained.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha2::Sha256;

/// TOTP at an explicit unix time: the first `digits` characters of
/// the standard-base64 HMAC-SHA256 over the big-endian window counter.
pub fn totp(secret: &str, digits: usize, step_secs: u64, unix_time: u64) -> String {
    let counter = if step_secs == 0 {
        unix_time
    } else {
        unix_time / step_secs
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let encoded = BASE64.encode(mac.finalize().into_bytes());
    encoded.chars().take(digits).collect()
}

/// TOTP for the current window.
pub fn totp_now(secret: &str, digits: usize, step_secs: u64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    totp(secret, digits, step_secs, now)
}

/// Hex MD5, used for topic names, rendezvous strings and the DHCP
/// lease file name.
pub fn md5_hex(s: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}
