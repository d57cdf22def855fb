//! Auth tickets
//!
//! A ticket is signed metadata enabling a non-owner to read specific
//! content, optionally carrying a re-encryption key for sealed files. On the
//! wire it is base64(JSON).

use crate::marker::{verify_signature, ClientKeys};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use shardvault_core::{Result, ShardVaultError};

/// Delegated-read token for one file of an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTicket {
    pub allocation_id: String,
    /// Owner client id (hex verifying key).
    pub owner_id: String,
    pub file_name: String,
    pub file_path_hash: String,
    /// Hex key material enabling the recipient to open sealed shards;
    /// empty for plaintext files.
    #[serde(default)]
    pub re_encryption_key: String,
    /// UNIX seconds; 0 means no expiry.
    pub expiration: i64,
    pub timestamp: i64,
    #[serde(default)]
    pub signature: String,
}

impl AuthTicket {
    fn signing_payload(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.allocation_id,
            self.owner_id,
            self.file_name,
            self.file_path_hash,
            self.re_encryption_key,
            self.expiration,
            self.timestamp
        )
        .into_bytes()
    }

    pub fn sign(&mut self, keys: &ClientKeys) {
        self.signature = keys.sign(&self.signing_payload());
    }

    /// Serialize to the on-wire base64 form.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ShardVaultError::AuthTicket(format!("encode: {}", e)))?;
        Ok(BASE64.encode(json))
    }

    /// Decode and structurally validate a ticket. Signature and expiry are
    /// checked separately by `verify`.
    pub fn decode(encoded: &str) -> Result<Self> {
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|e| ShardVaultError::AuthTicket(format!("base64: {}", e)))?;
        let ticket: AuthTicket = serde_json::from_slice(&json)
            .map_err(|e| ShardVaultError::AuthTicket(format!("json: {}", e)))?;
        if ticket.file_path_hash.is_empty() {
            return Err(ShardVaultError::AuthTicket(
                "missing file path hash".to_string(),
            ));
        }
        Ok(ticket)
    }

    /// Verify signature and expiry at time `now` (UNIX seconds).
    pub fn verify(&self, now: i64) -> Result<()> {
        if self.expiration > 0 && self.expiration < now {
            return Err(ShardVaultError::AuthTicket("ticket expired".to_string()));
        }
        verify_signature(&self.owner_id, &self.signing_payload(), &self.signature)
            .map_err(|_| ShardVaultError::AuthTicket("invalid signature".to_string()))
    }
}
