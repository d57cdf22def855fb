//! Typed records for blobber responses
//!
//! Every JSON document the engine parses off the wire has a typed shape
//! here; parse failures surface as `Corrupt`.

use serde::{Deserialize, Serialize};
use shardvault_core::{Result, ShardVaultError};

/// Reference type tag for regular files.
pub const FILE: &str = "f";
/// Reference type tag for directories.
pub const DIRECTORY: &str = "d";

/// One entry of the allocation tree as reported by a blobber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub path: String,
    pub lookup_hash: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// On-wire bytes held for this file (per blobber, summed fragments).
    pub size: u64,
    /// Logical file size.
    pub actual_size: u64,
    pub mime_type: String,
    pub content_hash: String,
    pub num_chunks: u64,
    pub chunk_size: u64,
    /// Key fingerprint when the file is encrypted, empty otherwise.
    #[serde(default)]
    pub encrypted_key: String,
    #[serde(default)]
    pub thumbnail_size: u64,
    #[serde(default)]
    pub thumbnail_hash: String,
    /// RFC-3339 timestamps as reported by the blobber.
    pub created_at: String,
    pub updated_at: String,
}

impl FileRef {
    pub fn is_dir(&self) -> bool {
        self.kind == DIRECTORY
    }

    pub fn is_encrypted(&self) -> bool {
        !self.encrypted_key.is_empty()
    }

    /// Fields that must agree across blobbers for metadata consensus.
    pub fn consensus_key(&self) -> (String, u64, String, u64) {
        (
            self.content_hash.clone(),
            self.actual_size,
            self.encrypted_key.clone(),
            self.num_chunks,
        )
    }
}

/// Listing of one directory level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResult {
    pub path: String,
    pub children: Vec<FileRef>,
}

/// Per-file statistics reported by a blobber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub path: String,
    pub num_updates: u64,
    pub num_block_downloads: u64,
    #[serde(default)]
    pub last_committed_at: String,
}

/// Acknowledgement of one uploaded shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadShardResult {
    pub chunk_index: usize,
    /// Echo of the fragment hash the blobber verified.
    pub hash: String,
}

/// Result of a commit round on one blobber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResult {
    pub allocation_root: String,
}

/// Write-marker lock outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WmLockStatus {
    Failed,
    Pending,
    Ok,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WmLockResult {
    pub status: WmLockStatus,
    #[serde(default)]
    pub created_at: i64,
}

/// Deterministic lookup hash for a remote path within an allocation.
pub fn lookup_hash(allocation_id: &str, path: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(allocation_id.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Decode a JSON blobber response into its typed record.
pub fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| ShardVaultError::Corrupt(format!("{}: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ref() -> FileRef {
        FileRef {
            name: "x.bin".into(),
            path: "/x.bin".into(),
            lookup_hash: "abcd".into(),
            kind: FILE.into(),
            size: 1024,
            actual_size: 1000,
            mime_type: "application/octet-stream".into(),
            content_hash: "deadbeef".into(),
            num_chunks: 2,
            chunk_size: 512,
            encrypted_key: String::new(),
            thumbnail_size: 0,
            thumbnail_hash: String::new(),
            created_at: "2024-01-01T00:00:00Z".into(),
            updated_at: "2024-01-02T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_fileref_roundtrip() {
        let json = serde_json::to_vec(&sample_ref()).unwrap();
        let parsed: FileRef = parse_json(&json, "file ref").unwrap();
        assert_eq!(parsed, sample_ref());
        assert!(!parsed.is_dir());
        assert!(!parsed.is_encrypted());
    }

    #[test]
    fn test_parse_error_is_corrupt() {
        let result: Result<FileRef> = parse_json(b"not json", "file ref");
        assert!(matches!(result, Err(ShardVaultError::Corrupt(_))));
    }

    #[test]
    fn test_wm_lock_status_tags() {
        let json = serde_json::to_string(&WmLockStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }

    #[test]
    fn test_consensus_key_ignores_timestamps() {
        let mut a = sample_ref();
        let mut b = sample_ref();
        a.updated_at = "2024-05-01T00:00:00Z".into();
        b.updated_at = "2024-06-01T00:00:00Z".into();
        assert_eq!(a.consensus_key(), b.consensus_key());
    }
}
