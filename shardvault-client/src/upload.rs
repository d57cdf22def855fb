//! Chunked upload pipeline
//!
//! Reads the source once, front to back, turning each chunk into one
//! fragment per blobber position. Fragments are staged against a connection
//! id and committed in batches of `chunks_per_commit` under the
//! write-marker mutex; each batch becomes visible atomically. The pipeline
//! tolerates blobber failures down to the consensus threshold and persists
//! progress so an interrupted transfer resumes on the same connection
//! without re-staging finished chunks.

use crate::allocation::AllocationCore;
use crate::blobber::{UploadMeta, UploadShardRequest};
use crate::callbacks::{CompletedInfo, OpKind, StatusCallback};
use crate::marker::{next_allocation_root, WriteMarker};
use crate::progress::{ProgressKey, UploadProgress};
use crate::wm_mutex::WriteMarkerMutex;
use bytes::Bytes;
use shardvault_core::{
    encode_payload, BlobberMask, Chunk, ChunkReader, Consensus, ContentHash, FragmentCodec,
    Result, ShardCipher, ShardVaultError,
};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters of one upload or update.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Defaults to `application/octet-stream`.
    pub mime_type: Option<String>,
    pub encrypt: bool,
    pub is_update: bool,
    pub thumbnail_path: Option<PathBuf>,
}

/// One upload in flight against the blobbers of an allocation.
pub struct ChunkedUpload {
    core: Arc<AllocationCore>,
    request: UploadRequest,
    mask: BlobberMask,
    consensus: Consensus,
    is_repair: bool,
    callback: Arc<dyn StatusCallback>,
}

pub(crate) fn validate_remote_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path != path.trim() {
        return Err(ShardVaultError::InvalidPath(path.to_string()));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(ShardVaultError::InvalidPath(path.to_string()));
    }
    Ok(())
}

impl ChunkedUpload {
    pub fn new(
        core: Arc<AllocationCore>,
        request: UploadRequest,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<Self> {
        let mask = BlobberMask::all(core.blobbers.len());
        let consensus = core.consensus();
        Self::build(core, request, mask, consensus, false, callback)
    }

    /// Restricted variant used by repair: only the blobbers in `mask` are
    /// written, and consensus is scaled to that restricted set.
    pub fn for_repair(
        core: Arc<AllocationCore>,
        request: UploadRequest,
        mask: BlobberMask,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<Self> {
        let consensus = core.consensus_for_mask(&mask);
        Self::build(core, request, mask, consensus, true, callback)
    }

    fn build(
        core: Arc<AllocationCore>,
        mut request: UploadRequest,
        mask: BlobberMask,
        consensus: Consensus,
        is_repair: bool,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<Self> {
        validate_remote_path(&request.remote_path)?;
        if request.remote_path == "/" {
            return Err(ShardVaultError::InvalidPath(request.remote_path.clone()));
        }
        if core.blobbers.len() < core.data_shards + core.parity_shards {
            return Err(ShardVaultError::NoBlobbers {
                have: core.blobbers.len(),
                need: core.data_shards + core.parity_shards,
            });
        }
        request.encrypt = request.encrypt || core.config.encrypt_on_upload;
        Ok(Self {
            core,
            request,
            mask,
            consensus,
            is_repair,
            callback,
        })
    }

    pub fn op_kind(&self) -> OpKind {
        if self.is_repair {
            OpKind::Repair
        } else if self.request.is_update {
            OpKind::Update
        } else {
            OpKind::Upload
        }
    }

    /// Run the upload to completion. Terminal callbacks are the caller's
    /// responsibility; this reports `started` and `in_progress` only.
    pub async fn run(mut self, token: CancellationToken) -> Result<CompletedInfo> {
        let core = Arc::clone(&self.core);
        let actual_size = std::fs::metadata(&self.request.local_path)?.len();
        let mime_type = self
            .request
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let cipher = if self.request.encrypt {
            Some(core.shard_cipher()?)
        } else {
            None
        };
        let encrypted_key = cipher
            .as_ref()
            .map(|c| c.key().fingerprint_hex())
            .unwrap_or_default();

        let progress_id = ProgressKey {
            allocation_id: &core.id,
            remote_path: &self.request.remote_path,
            actual_size,
            chunk_size: core.config.chunk_size,
            is_update: self.request.is_update,
            is_repair: self.is_repair,
            encrypt: self.request.encrypt,
        }
        .fingerprint();
        let mut progress = match core.progress.load_upload(&progress_id) {
            Some(saved) => {
                info!(path = %self.request.remote_path, chunk = saved.chunk_index, "resuming upload");
                self.mask = self.mask.intersect(BlobberMask::from_bits(saved.upload_mask));
                saved
            }
            None => UploadProgress {
                id: progress_id.clone(),
                connection_id: core.new_connection_id(),
                chunk_index: 0,
                upload_offset: 0,
                chunk_size: core.config.chunk_size,
                upload_mask: self.mask.bits(),
            },
        };

        let (thumbnail_fragments, thumbnail_hash) = self.encode_thumbnail(cipher.as_ref())?;

        let op = self.op_kind();
        self.callback
            .started(&core.id, &self.request.remote_path, op, actual_size);

        let source = File::open(&self.request.local_path)?;
        let mut reader = ChunkReader::new(
            source,
            core.data_shards,
            core.parity_shards,
            core.config.chunk_size,
            cipher,
        )?;

        let per_commit = core.config.chunks_per_commit;
        let mut pending_hashes = Vec::new();
        let mut final_chunk = None;
        while let Some(chunk) = reader.next_chunk()? {
            if token.is_cancelled() {
                return Err(ShardVaultError::Cancelled);
            }
            if chunk.is_final {
                // Staged after finalize, once the file-level hash is known.
                final_chunk = Some(chunk);
                break;
            }
            if chunk.index < progress.chunk_index {
                // Already staged on a previous run of this connection.
                continue;
            }
            self.stage_chunk(
                &token,
                &progress.connection_id,
                &chunk,
                actual_size,
                &mime_type,
                &encrypted_key,
                &thumbnail_hash,
                "",
                chunk.index == 0,
                &thumbnail_fragments,
            )
            .await?;
            pending_hashes.push(chunk.challenge_hash.clone());

            progress.chunk_index = chunk.index + 1;
            progress.upload_offset = reader.total_read();
            progress.upload_mask = self.mask.bits();
            if pending_hashes.len() >= per_commit {
                core.progress.save_upload(&progress)?;
                self.commit(&progress.connection_id, reader.total_read(), &pending_hashes)
                    .await?;
                pending_hashes.clear();
            }
            self.callback.in_progress(
                &core.id,
                &self.request.remote_path,
                op,
                reader.total_read(),
            );
        }

        let total_read = reader.total_read();
        let hashes = reader.finalize();
        if let Some(chunk) = final_chunk {
            if chunk.index >= progress.chunk_index {
                let with_thumbnail = chunk.index == 0;
                self.stage_chunk(
                    &token,
                    &progress.connection_id,
                    &chunk,
                    total_read,
                    &mime_type,
                    &encrypted_key,
                    &thumbnail_hash,
                    &hashes.content_hash,
                    with_thumbnail,
                    &thumbnail_fragments,
                )
                .await?;
                pending_hashes.push(chunk.challenge_hash.clone());
            }
            self.callback
                .in_progress(&core.id, &self.request.remote_path, op, total_read);
        }

        core.progress.save_upload(&progress)?;
        self.commit(&progress.connection_id, actual_size, &pending_hashes)
            .await?;
        core.progress.remove(&progress_id);

        Ok(CompletedInfo {
            size: actual_size,
            mime_type,
            content_hash: hashes.content_hash,
        })
    }

    fn encode_thumbnail(
        &self,
        cipher: Option<&ShardCipher>,
    ) -> Result<(Vec<Bytes>, String)> {
        let Some(path) = &self.request.thumbnail_path else {
            return Ok((Vec::new(), String::new()));
        };
        let raw = std::fs::read(path)?;
        let hash = ContentHash::compute(&raw).to_hex();
        let codec = FragmentCodec::new(self.core.data_shards, self.core.parity_shards)?;
        let fragments = encode_payload(&codec, cipher, &raw)?;
        Ok((fragments.into_iter().map(Bytes::from).collect(), hash))
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage_chunk(
        &mut self,
        token: &CancellationToken,
        connection_id: &str,
        chunk: &Chunk,
        actual_size: u64,
        mime_type: &str,
        encrypted_key: &str,
        thumbnail_hash: &str,
        actual_hash: &str,
        with_thumbnail: bool,
        thumbnail_fragments: &[Bytes],
    ) -> Result<()> {
        let filename = self
            .request
            .remote_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let uploads = self.mask.iter().map(|i| {
            let blobber = Arc::clone(&self.core.blobbers[i]);
            let req = UploadShardRequest {
                connection_id: connection_id.to_string(),
                meta: UploadMeta {
                    filename: filename.clone(),
                    path: self.request.remote_path.clone(),
                    hash: chunk.fragment_hashes[i].clone(),
                    challenge_hash: chunk.challenge_hash.clone(),
                    chunk_index: chunk.index,
                    is_final: chunk.is_final,
                    actual_size,
                    mime_type: mime_type.to_string(),
                    encrypted_key: encrypted_key.to_string(),
                    actual_hash: actual_hash.to_string(),
                    thumbnail_hash: thumbnail_hash.to_string(),
                },
                shard: Bytes::from(chunk.fragments[i].clone()),
                thumbnail_shard: (with_thumbnail && !thumbnail_fragments.is_empty())
                    .then(|| thumbnail_fragments[i].clone()),
            };
            let allocation_id = self.core.id.clone();
            async move { (i, blobber.upload_shard(&allocation_id, req).await) }
        });
        // Cancellation must interrupt the in-flight fan-out, not just the
        // gap between chunks.
        let outcomes = tokio::select! {
            _ = token.cancelled() => return Err(ShardVaultError::Cancelled),
            outcomes = futures::future::join_all(uploads) => outcomes,
        };
        for (i, outcome) in outcomes {
            if let Err(e) = outcome {
                debug!(blobber = %self.core.blobbers[i].blobber_id(), error = %e, "shard upload failed");
                self.mask.clear(i);
            }
        }
        self.check_mask()
    }

    async fn commit(
        &mut self,
        connection_id: &str,
        actual_size: u64,
        challenge_hashes: &[String],
    ) -> Result<()> {
        let core = Arc::clone(&self.core);
        // The lock spans the whole blobber set even when the write itself
        // targets a repair subset; only commit consensus is scoped to it.
        let mutex = WriteMarkerMutex::new(
            core.id.clone(),
            core.blobbers.clone(),
            core.consensus().threshold(),
        );
        let guard = mutex.lock(connection_id, LOCK_TIMEOUT).await?;

        let prev_root = core.allocation_root();
        // A repair restores fragments the tree already accounts for, so the
        // root stays put; only fresh content advances it.
        let next_root = if self.is_repair {
            prev_root.clone()
        } else {
            next_allocation_root(&prev_root, challenge_hashes)
        };
        let timestamp = core.next_wm_timestamp();
        let commits = self.mask.iter().map(|i| {
            let blobber = Arc::clone(&core.blobbers[i]);
            let mut marker = WriteMarker {
                allocation_id: core.id.clone(),
                client_id: core.keys.client_id().to_string(),
                blobber_id: blobber.blobber_id().to_string(),
                prev_allocation_root: prev_root.clone(),
                allocation_root: next_root.clone(),
                size: actual_size as i64,
                timestamp,
                signature: String::new(),
            };
            marker.sign(&core.keys);
            let allocation_id = core.id.clone();
            let connection_id = connection_id.to_string();
            async move { (i, blobber.commit(&allocation_id, &connection_id, &marker).await) }
        });
        let mut consensus = self.consensus.clone();
        for (i, outcome) in futures::future::join_all(commits).await {
            match outcome {
                Ok(_) => consensus.add_success(),
                Err(e) => {
                    debug!(blobber = %core.blobbers[i].blobber_id(), error = %e, "commit failed");
                    self.mask.clear(i);
                }
            }
        }
        mutex.unlock(connection_id, guard).await;
        consensus.check()?;
        if !self.is_repair {
            core.set_allocation_root(next_root);
        }
        Ok(())
    }

    fn check_mask(&self) -> Result<()> {
        if !self.consensus.is_viable(&self.mask) {
            return Err(ShardVaultError::ConsensusFailed {
                successes: self.mask.count(),
                threshold: self.consensus.threshold(),
                full: self.consensus.full(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path_validation() {
        assert!(validate_remote_path("/a/b.txt").is_ok());
        assert!(validate_remote_path("relative.txt").is_err());
        assert!(validate_remote_path("/trailing/").is_err());
        assert!(validate_remote_path(" /padded").is_err());
    }
}
