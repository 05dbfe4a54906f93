//! Cryptographic building blocks: the rotating key schedule shared by
//! topic names, discovery rendezvous and the sealing key; the AES-GCM
//! message sealer; and the ECDSA-P521 signature scheme used by the
//! trust-zone authentication provider.

pub mod ecdsa;
pub mod otp;
pub mod sealer;

pub use otp::{md5_hex, totp, totp_now};
pub use sealer::{AesSealer, Sealer};

/// Errors surfaced by the crypto crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("seal: {0}")]
    Seal(String),
    #[error("unseal: {0}")]
    Unseal(String),
    #[error("malformed key material: {0}")]
    KeyMaterial(String),
    #[error("signature rejected")]
    BadSignature,
}
