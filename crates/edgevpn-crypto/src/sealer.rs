//! Symmetric message sealing for the private gossip channel.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};

use crate::Error;

const NONCE_LEN: usize = 12;

/// Seals and unseals gossip payloads with a key derived per window.
/// The key string is the 32-character hex MD5 of the window's TOTP;
/// its ASCII bytes are the AES-256 key.
pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &[u8], key: &str) -> Result<String, Error>;
    fn unseal(&self, sealed: &str, key: &str) -> Result<Vec<u8>, Error>;
}

/// AES-256-GCM with a random 12-byte nonce; output is
/// hex(nonce || ciphertext+tag).
#[derive(Debug, Default, Clone, Copy)]
pub struct AesSealer;

fn cipher(key: &str) -> Aes256Gcm {
    let mut material = [0u8; 32];
    let bytes = key.as_bytes();
    let n = bytes.len().min(32);
    material[..n].copy_from_slice(&bytes[..n]);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&material))
}

impl Sealer for AesSealer {
    fn seal(&self, plaintext: &[u8], key: &str) -> Result<String, Error> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher(key)
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Seal(e.to_string()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    fn unseal(&self, sealed: &str, key: &str) -> Result<Vec<u8>, Error> {
        let bytes = hex::decode(sealed).map_err(|e| Error::Unseal(e.to_string()))?;
        if bytes.len() < NONCE_LEN {
            return Err(Error::Unseal("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        cipher(key)
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Unseal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_unseal_roundtrip() {
        let sealer = AesSealer;
        let sealed = sealer.seal(b"hello overlay", "0123456789abcdef0123456789abcdef").unwrap();
        assert!(sealed.chars().all(|c| c.is_ascii_hexdigit()));
        let plain = sealer
            .unseal(&sealed, "0123456789abcdef0123456789abcdef")
            .unwrap();
        assert_eq!(plain, b"hello overlay");
    }

    #[test]
    fn wrong_key_fails() {
        let sealer = AesSealer;
        let sealed = sealer.seal(b"hello", "key-one").unwrap();
        assert!(sealer.unseal(&sealed, "key-two").is_err());
    }

    #[test]
    fn nonce_makes_output_nondeterministic() {
        let sealer = AesSealer;
        let a = sealer.seal(b"same", "key").unwrap();
        let b = sealer.seal(b"same", "key").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let sealer = AesSealer;
        assert!(sealer.unseal("aabb", "key").is_err());
        assert!(sealer.unseal("zz-not-hex", "key").is_err());
    }

    #[test]
    fn binary_payloads_survive() {
        let sealer = AesSealer;
        let payload: Vec<u8> = (0..=255).collect();
        let sealed = sealer.seal(&payload, "key").unwrap();
        assert_eq!(sealer.unseal(&sealed, "key").unwrap(), payload);
    }
}
