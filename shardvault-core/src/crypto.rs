//! Per-shard encryption
//!
//! When encryption is enabled each data shard of a chunk is sealed
//! independently with AES-256-GCM under a per-file key. A sealed shard is:
//!
//! ```text
//! [ header region: 2048 bytes ][ ciphertext || 16-byte tag ]
//! ```
//!
//! The header region carries the nonce and a key fingerprint, zero-padded to
//! its fixed size, so the on-wire overhead per shard is constant and the
//! effective payload for chunk size `S` is `S - 2048 - 16`. Parity is
//! computed over sealed shards, so a shard recovered from parity decrypts
//! like any other.

use crate::error::{Result, ShardVaultError};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fmt;

/// AES-256-GCM key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (12 bytes / 96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Fixed per-shard header region carrying nonce and key fingerprint.
pub const ENCRYPTION_HEADER_SIZE: usize = 2 * 1024;

/// Total fixed overhead a sealed shard adds over its plaintext.
pub const ENCRYPTION_OVERHEAD: usize = ENCRYPTION_HEADER_SIZE + TAG_SIZE;

const FINGERPRINT_SIZE: usize = 32;

/// Per-file encryption key.
#[derive(Clone)]
pub struct ShardKey([u8; KEY_SIZE]);

impl ShardKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(ShardVaultError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Non-reversible identifier of the key, stored in sealed-shard headers.
    pub fn fingerprint(&self) -> [u8; FINGERPRINT_SIZE] {
        *blake3::hash(&self.0).as_bytes()
    }

    /// Hex form used in file references (`encrypted_key` field).
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }
}

impl fmt::Debug for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardKey([REDACTED])")
    }
}

impl Drop for ShardKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Seals and opens individual shards under a per-file key.
pub struct ShardCipher {
    key: ShardKey,
    cipher: Aes256Gcm,
}

impl ShardCipher {
    pub fn new(key: ShardKey) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| ShardVaultError::Encrypt(e.to_string()))?;
        Ok(Self { key, cipher })
    }

    pub fn key(&self) -> &ShardKey {
        &self.key
    }

    /// Sealed length for a given plaintext length.
    pub const fn sealed_len(plaintext_len: usize) -> usize {
        ENCRYPTION_HEADER_SIZE + plaintext_len + TAG_SIZE
    }

    /// Seal one shard. Output layout is header region then ciphertext+tag.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| ShardVaultError::Encrypt(e.to_string()))?;

        let mut sealed = vec![0u8; ENCRYPTION_HEADER_SIZE + ciphertext.len()];
        sealed[..NONCE_SIZE].copy_from_slice(&nonce_bytes);
        sealed[NONCE_SIZE..NONCE_SIZE + FINGERPRINT_SIZE].copy_from_slice(&self.key.fingerprint());
        sealed[ENCRYPTION_HEADER_SIZE..].copy_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open one sealed shard.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < ENCRYPTION_OVERHEAD {
            return Err(ShardVaultError::Decrypt(format!(
                "sealed shard too short: {} bytes",
                sealed.len()
            )));
        }
        let fingerprint = &sealed[NONCE_SIZE..NONCE_SIZE + FINGERPRINT_SIZE];
        if fingerprint != self.key.fingerprint() {
            return Err(ShardVaultError::Decrypt(
                "key fingerprint mismatch".to_string(),
            ));
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &sealed[ENCRYPTION_HEADER_SIZE..])
            .map_err(|_| ShardVaultError::Decrypt("authentication failed".to_string()))
    }
}
