//! Cryptographic operations for the wallet
//!
//! This module provides:
//! - Ed25519 key pair generation, signing, and verification of redemption intents
//! - SHA-256 hashing and the redemption fingerprint derived from it

use crate::{types::AccountId, Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Length of a redemption fingerprint in hex characters
pub const FINGERPRINT_LEN: usize = 16;

/// Ed25519 key pair for signing intents
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from a hex-encoded 32 byte seed
    pub fn from_hex_seed(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| Error::Config(format!("Invalid signing seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("Signing seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign a message, returning the hex-encoded signature
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Verify a hex-encoded signature
    pub fn verify_hex(&self, message: &[u8], signature: &str) -> Result<()> {
        let bytes = hex::decode(signature)
            .map_err(|e| Error::Signature(format!("Malformed signature: {}", e)))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| Error::Signature("Signature must be 64 bytes".to_string()))?;

        self.verifying_key
            .verify(message, &Signature::from_bytes(&bytes))
            .map_err(|e| Error::Signature(format!("Verification failed: {}", e)))
    }
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Redemption fingerprint: truncated SHA-256 of `account_id:expires_at_millis`
///
/// Two presentations of the same intent always produce the same value.
pub fn fingerprint(account_id: &AccountId, expires_at_millis: i64) -> String {
    let digest = hash_bytes(format!("{}:{}", account_id, expires_at_millis).as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}
