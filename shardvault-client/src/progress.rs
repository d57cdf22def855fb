//! Resumable progress records
//!
//! Uploads and downloads persist a small JSON record after each committed
//! batch so an interrupted transfer can pick up where it stopped. Records
//! are keyed by a fingerprint of the parameters that define the transfer;
//! changing any of them (size, chunk size, encryption) makes the old record
//! unreachable rather than silently reused.

use serde::{Deserialize, Serialize};
use shardvault_core::Result;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Parameters that identify one resumable transfer.
#[derive(Debug, Clone)]
pub struct ProgressKey<'a> {
    pub allocation_id: &'a str,
    pub remote_path: &'a str,
    pub actual_size: u64,
    pub chunk_size: usize,
    pub is_update: bool,
    pub is_repair: bool,
    pub encrypt: bool,
}

impl ProgressKey<'_> {
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.allocation_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.remote_path.as_bytes());
        hasher.update(b"\0");
        hasher.update(&self.actual_size.to_le_bytes());
        hasher.update(&(self.chunk_size as u64).to_le_bytes());
        hasher.update(&[
            self.is_update as u8,
            self.is_repair as u8,
            self.encrypt as u8,
        ]);
        hasher.finalize().to_hex().to_string()
    }
}

/// State of a partially committed upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgress {
    pub id: String,
    pub connection_id: String,
    /// First chunk index not yet committed.
    pub chunk_index: usize,
    /// Source bytes consumed by committed chunks.
    pub upload_offset: u64,
    pub chunk_size: usize,
    /// Blobbers that have acknowledged every committed batch.
    pub upload_mask: u128,
}

/// State of a partially written download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub id: String,
    /// First block index not yet written to the sink.
    pub block_index: u64,
    pub bytes_written: u64,
}

/// Filesystem-backed store of progress records.
pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.json", id, kind))
    }

    pub fn load_upload(&self, id: &str) -> Option<UploadProgress> {
        self.load(id, "up")
    }

    pub fn save_upload(&self, progress: &UploadProgress) -> Result<()> {
        self.save(&progress.id, "up", progress)
    }

    pub fn load_download(&self, id: &str) -> Option<DownloadProgress> {
        self.load(id, "down")
    }

    pub fn save_download(&self, progress: &DownloadProgress) -> Result<()> {
        self.save(&progress.id, "down", progress)
    }

    /// Drop both records for a finished or aborted transfer.
    pub fn remove(&self, id: &str) {
        for kind in ["up", "down"] {
            let _ = fs::remove_file(self.path(id, kind));
        }
    }

    fn load<T: serde::de::DeserializeOwned>(&self, id: &str, kind: &str) -> Option<T> {
        let bytes = fs::read(self.path(id, kind)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                // A mangled record is treated as no record at all.
                debug!(id, error = %e, "discarding unreadable progress record");
                let _ = fs::remove_file(self.path(id, kind));
                None
            }
        }
    }

    fn save<T: Serialize>(&self, id: &str, kind: &str, record: &T) -> Result<()> {
        let path = self.path(id, kind);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| shardvault_core::ShardVaultError::Corrupt(format!("progress: {}", e)))?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str, size: u64) -> String {
        ProgressKey {
            allocation_id: "alloc",
            remote_path: path,
            actual_size: size,
            chunk_size: 65536,
            is_update: false,
            is_repair: false,
            encrypt: false,
        }
        .fingerprint()
    }

    #[test]
    fn test_fingerprint_changes_with_parameters() {
        assert_eq!(key("/a", 10), key("/a", 10));
        assert_ne!(key("/a", 10), key("/a", 11));
        assert_ne!(key("/a", 10), key("/b", 10));
    }

    #[test]
    fn test_save_load_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path()).unwrap();
        let progress = UploadProgress {
            id: key("/a", 100),
            connection_id: "conn1".into(),
            chunk_index: 4,
            upload_offset: 262144,
            chunk_size: 65536,
            upload_mask: 0b111,
        };
        store.save_upload(&progress).unwrap();
        let loaded = store.load_upload(&progress.id).unwrap();
        assert_eq!(loaded.chunk_index, 4);
        assert_eq!(loaded.upload_mask, 0b111);
        store.remove(&progress.id);
        assert!(store.load_upload(&progress.id).is_none());
    }

    #[test]
    fn test_corrupt_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("abc.up.json"), b"{broken").unwrap();
        assert!(store.load_upload("abc").is_none());
        assert!(!dir.path().join("abc.up.json").exists());
    }
}
