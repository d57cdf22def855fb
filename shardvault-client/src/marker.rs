//! Write and read markers
//!
//! A write marker is the client's signed assertion that a new allocation
//! root supersedes the previous one; a read marker authorizes one blobber to
//! serve one batch of blocks and carries a counter that must be strictly
//! increasing per (client, blobber) pair.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use shardvault_core::{Result, ShardVaultError};

/// Client identity and signing key.
pub struct ClientKeys {
    signing: SigningKey,
    client_id: String,
}

impl ClientKeys {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let client_id = hex::encode(signing.verifying_key().to_bytes());
        Self { signing, client_id }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let client_id = hex::encode(signing.verifying_key().to_bytes());
        Self { signing, client_id }
    }

    /// Hex of the verifying key; doubles as the client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign the blake3 digest of a canonical payload, returning hex.
    pub fn sign(&self, payload: &[u8]) -> String {
        let digest = blake3::hash(payload);
        hex::encode(self.signing.sign(digest.as_bytes()).to_bytes())
    }
}

/// Verify a hex signature over a canonical payload against a hex client id.
pub fn verify_signature(client_id: &str, payload: &[u8], signature: &str) -> Result<()> {
    let key_bytes: [u8; 32] = hex::decode(client_id)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| ShardVaultError::Corrupt("invalid client id".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| ShardVaultError::Corrupt(format!("invalid verifying key: {}", e)))?;
    let sig_bytes: [u8; 64] = hex::decode(signature)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| ShardVaultError::Corrupt("invalid signature encoding".to_string()))?;
    let digest = blake3::hash(payload);
    key.verify(digest.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .map_err(|_| ShardVaultError::IntegrityFailed("signature verification".to_string()))
}

/// Signed assertion committing a new allocation root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteMarker {
    pub allocation_id: String,
    pub client_id: String,
    pub blobber_id: String,
    pub prev_allocation_root: String,
    pub allocation_root: String,
    /// Logical bytes added (negative for deletes).
    pub size: i64,
    /// UNIX seconds; strictly increasing per (allocation, blobber).
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
}

impl WriteMarker {
    fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.allocation_id,
            self.client_id,
            self.blobber_id,
            self.prev_allocation_root,
            self.allocation_root,
            self.size,
            self.timestamp
        )
        .into_bytes()
    }

    pub fn sign(&mut self, keys: &ClientKeys) {
        self.signature = keys.sign(&self.signing_payload());
    }

    pub fn verify(&self) -> Result<()> {
        verify_signature(&self.client_id, &self.signing_payload(), &self.signature)
    }
}

/// Signed authorization for one batch of block reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadMarker {
    pub allocation_id: String,
    pub client_id: String,
    pub blobber_id: String,
    /// Strictly increasing per (client, blobber) pair.
    pub counter: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
}

impl ReadMarker {
    fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{}",
            self.allocation_id, self.client_id, self.blobber_id, self.counter, self.timestamp
        )
        .into_bytes()
    }

    pub fn sign(&mut self, keys: &ClientKeys) {
        self.signature = keys.sign(&self.signing_payload());
    }

    pub fn verify(&self) -> Result<()> {
        verify_signature(&self.client_id, &self.signing_payload(), &self.signature)
    }
}

/// Derive the allocation root that supersedes `prev` after committing a
/// batch of chunks, identified by their challenge hashes.
pub fn next_allocation_root(prev: &str, challenge_hashes: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev.as_bytes());
    for challenge in challenge_hashes {
        hasher.update(challenge.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_marker_sign_verify() {
        let keys = ClientKeys::generate();
        let mut marker = WriteMarker {
            allocation_id: "alloc".into(),
            client_id: keys.client_id().to_string(),
            blobber_id: "b0".into(),
            prev_allocation_root: "root0".into(),
            allocation_root: "root1".into(),
            size: 1024,
            timestamp: 1_700_000_000,
            signature: String::new(),
        };
        marker.sign(&keys);
        marker.verify().unwrap();
    }

    #[test]
    fn test_tampered_marker_fails_verification() {
        let keys = ClientKeys::generate();
        let mut marker = ReadMarker {
            allocation_id: "alloc".into(),
            client_id: keys.client_id().to_string(),
            blobber_id: "b1".into(),
            counter: 7,
            timestamp: 1_700_000_000,
            signature: String::new(),
        };
        marker.sign(&keys);
        marker.counter = 8;
        assert!(marker.verify().is_err());
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let keys = ClientKeys::generate();
        let other = ClientKeys::generate();
        let mut marker = WriteMarker {
            allocation_id: "alloc".into(),
            client_id: keys.client_id().to_string(),
            blobber_id: "b0".into(),
            prev_allocation_root: String::new(),
            allocation_root: "r".into(),
            size: 0,
            timestamp: 1,
            signature: String::new(),
        };
        marker.signature = other.sign(b"something else");
        assert!(marker.verify().is_err());
    }

    #[test]
    fn test_allocation_root_depends_on_order() {
        let a = next_allocation_root("prev", &["c1".into(), "c2".into()]);
        let b = next_allocation_root("prev", &["c2".into(), "c1".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_client_id_is_stable_for_seed() {
        let a = ClientKeys::from_seed([9u8; 32]);
        let b = ClientKeys::from_seed([9u8; 32]);
        assert_eq!(a.client_id(), b.client_id());
    }
}
