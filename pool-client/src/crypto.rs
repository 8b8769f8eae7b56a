//! Cryptographic operations for the pool client
//!
//! This module provides:
//! - Ed25519 verification keys and signatures for validator nodes
//! - SHA-256 hashing for transactions, payloads and signed digests
//! - Deterministic key derivation from seeds (used by the simulated pool)

use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 32-byte SHA-256 digest
pub type Hash = [u8; 32];

/// Domain tag for state proof signatures
const STATE_PROOF_DOMAIN: &[u8] = b"state-proof";

/// Domain tag for pool ledger consistency signatures
const POOL_LEDGER_DOMAIN: &[u8] = b"pool-ledger";

/// Ed25519 key pair for signing
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

    /// Verification key of this pair
    pub fn verkey(&self) -> VerKey {
        VerKey::from_bytes(self.verifying_key.to_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }
}

/// Validator verification key (Ed25519 public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerKey(#[serde(with = "hex_bytes")] [u8; 32]);

impl VerKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a hex string
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded)
            .map_err(|e| Error::Configuration(format!("Invalid verkey hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::Configuration(format!("Invalid verkey length: {} bytes", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether the bytes decode to a usable Ed25519 point
    pub fn is_valid(&self) -> bool {
        VerifyingKey::from_bytes(&self.0).is_ok()
    }

    /// Verify a signature over `message`
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let verifying_key = match VerifyingKey::from_bytes(&self.0) {
            Ok(key) => key,
            Err(_) => return false,
        };

        let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
        verifying_key.verify(message, &dalek_sig).is_ok()
    }
}

impl fmt::Debug for VerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for VerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "hex_bytes")] [u8; 64]);

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Digest signed by validators over a ledger state root
pub fn state_proof_digest(root_hash: &Hash, pool_seq_no: u64, timestamp: u64) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(STATE_PROOF_DOMAIN);
    hasher.update(root_hash);
    hasher.update(pool_seq_no.to_be_bytes());
    hasher.update(timestamp.to_be_bytes());
    hasher.finalize().into()
}

/// Digest signed by validators over a pool ledger size and root
pub fn pool_ledger_digest(seq_no_end: u64, pool_root: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(POOL_LEDGER_DOMAIN);
    hasher.update(seq_no_end.to_be_bytes());
    hasher.update(pool_root);
    hasher.finalize().into()
}

/// Serde helper encoding fixed-size byte arrays as lowercase hex strings
pub(crate) mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(de::Error::custom)?;
        bytes.try_into().map_err(|v: Vec<u8>| {
            de::Error::custom(format!("expected {} bytes, got {}", N, v.len()))
        })
    }
}
