//! Engine configuration

use shardvault_core::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use std::path::PathBuf;
use std::time::Duration;

/// Blocks batched under one read marker by default.
pub const DEFAULT_BLOCKS_PER_MARKER: u64 = 10;

/// Upper bound on blocks per read marker.
pub const MAX_BLOCKS_PER_MARKER: u64 = 100;

/// Per-allocation engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-upload chunk payload granularity in bytes.
    pub chunk_size: usize,
    /// Chunks batched before each commit.
    pub chunks_per_commit: usize,
    /// Blocks requested per read marker (1-100).
    pub num_block_downloads: u64,
    /// Seal each data shard with the allocation key on upload.
    pub encrypt_on_upload: bool,
    /// Recompute and compare the content hash after download.
    pub verify_download: bool,
    /// Deadline for metadata calls against a single blobber.
    pub request_timeout: Duration,
    /// Directory holding upload/download progress records.
    pub progress_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_per_commit: 1,
            num_block_downloads: DEFAULT_BLOCKS_PER_MARKER,
            encrypt_on_upload: false,
            verify_download: false,
            request_timeout: Duration::from_secs(30),
            progress_dir: std::env::temp_dir(),
        }
    }
}

impl EngineConfig {
    /// Clamp fields into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self.chunks_per_commit = self.chunks_per_commit.max(1);
        self.num_block_downloads = self.num_block_downloads.clamp(1, MAX_BLOCKS_PER_MARKER);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.chunks_per_commit, 1);
        assert_eq!(config.num_block_downloads, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_normalized_clamps() {
        let config = EngineConfig {
            num_block_downloads: 500,
            chunks_per_commit: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.num_block_downloads, 100);
        assert_eq!(config.chunks_per_commit, 1);
    }
}
