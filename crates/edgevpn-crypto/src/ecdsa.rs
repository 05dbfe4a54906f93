//! ECDSA-P521 signatures in the trust-zone exchange format: keys and
//! signatures travel as base64url-wrapped PEM blocks so they can sit
//! in ledger values and message annotations as plain text.
//!
//! The signed message is the ASCII hex SHA-256 digest of the payload,
//! and signatures are ASN.1 (R,S) inside a `SIGNATURE` PEM block.

use base64::engine::general_purpose::URL_SAFE as BASE64URL;
use base64::Engine;
use ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use ecdsa::SignatureEncoding;
use p521::ecdsa::{Signature, SigningKey, VerifyingKey};
use p521::pkcs8::{DecodePublicKey, EncodePublicKey};
use p521::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::Error;

const PRIVATE_TAG: &str = "EC PRIVATE KEY";
const PUBLIC_TAG: &str = "EC PUBLIC KEY";
const SIGNATURE_TAG: &str = "SIGNATURE";

/// Generate a fresh keypair, both halves encoded for transport.
pub fn generate_keys() -> Result<(String, String), Error> {
    let secret = SecretKey::random(&mut OsRng);

    let private_der = secret
        .to_sec1_der()
        .map_err(|e| Error::KeyMaterial(e.to_string()))?;
    let private_pem = pem::encode(&pem::Pem::new(PRIVATE_TAG, private_der.to_vec()));

    let public_der = secret
        .public_key()
        .to_public_key_der()
        .map_err(|e| Error::KeyMaterial(e.to_string()))?;
    let public_pem = pem::encode(&pem::Pem::new(PUBLIC_TAG, public_der.into_vec()));

    Ok((
        BASE64URL.encode(private_pem),
        BASE64URL.encode(public_pem),
    ))
}

/// Sign `data` with an encoded private key.
pub fn sign(private_key: &str, data: &[u8]) -> Result<String, Error> {
    let secret = load_private_key(private_key)?;
    let signing_key = SigningKey::from(ecdsa::SigningKey::<p521::NistP521>::from(&secret));

    let signature: Signature = signing_key
        .sign_prehash(&hash_hex(data))
        .map_err(|e| Error::KeyMaterial(e.to_string()))?;

    let block = pem::encode(&pem::Pem::new(SIGNATURE_TAG, signature.to_der().to_vec()));
    Ok(BASE64URL.encode(block))
}

/// Verify `signature` over `data` against an encoded public key.
pub fn verify(public_key: &str, signature: &str, data: &[u8]) -> Result<(), Error> {
    let key = load_public_key(public_key)?;
    let verifying_key = VerifyingKey::from(ecdsa::VerifyingKey::<p521::NistP521>::from(&key));

    let decoded = BASE64URL
        .decode(signature.trim())
        .map_err(|e| Error::KeyMaterial(e.to_string()))?;
    let block = pem::parse(decoded).map_err(|e| Error::KeyMaterial(e.to_string()))?;
    let signature = Signature::from_der(block.contents())
        .map_err(|e| Error::KeyMaterial(e.to_string()))?;

    verifying_key
        .verify_prehash(&hash_hex(data), &signature)
        .map_err(|_| Error::BadSignature)
}

/// The signed message: hex digits of the SHA-256 digest, as bytes.
fn hash_hex(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize()).into_bytes()
}

fn load_private_key(encoded: &str) -> Result<SecretKey, Error> {
    let pem_bytes = BASE64URL
        .decode(encoded.trim())
        .map_err(|e| Error::KeyMaterial(e.to_string()))?;
    let block = pem::parse(pem_bytes).map_err(|e| Error::KeyMaterial(e.to_string()))?;
    SecretKey::from_sec1_der(block.contents()).map_err(|e| Error::KeyMaterial(e.to_string()))
}

fn load_public_key(encoded: &str) -> Result<PublicKey, Error> {
    let pem_bytes = BASE64URL
        .decode(encoded.trim())
        .map_err(|e| Error::KeyMaterial(e.to_string()))?;
    let block = pem::parse(pem_bytes).map_err(|e| Error::KeyMaterial(e.to_string()))?;
    PublicKey::from_public_key_der(block.contents())
        .map_err(|e| Error::KeyMaterial(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let (private, public) = generate_keys().unwrap();
        let signature = sign(&private, b"challenge").unwrap();
        assert!(verify(&public, &signature, b"challenge").is_ok());
    }

    #[test]
    fn wrong_payload_is_rejected() {
        let (private, public) = generate_keys().unwrap();
        let signature = sign(&private, b"challenge").unwrap();
        assert!(verify(&public, &signature, b"not the challenge").is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let (private, _) = generate_keys().unwrap();
        let (_, other_public) = generate_keys().unwrap();
        let signature = sign(&private, b"challenge").unwrap();
        assert!(verify(&other_public, &signature, b"challenge").is_err());
    }

    #[test]
    fn keys_are_urlsafe_text() {
        let (private, public) = generate_keys().unwrap();
        for encoded in [&private, &public] {
            assert!(encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=')));
        }
    }

    #[test]
    fn garbage_inputs_error_cleanly() {
        let (private, public) = generate_keys().unwrap();
        assert!(sign("garbage", b"x").is_err());
        assert!(verify(&public, "garbage", b"x").is_err());
        assert!(verify("garbage", &sign(&private, b"x").unwrap(), b"x").is_err());
    }
}
