//! Chunked download pipeline
//!
//! Resolves the file's metadata by consensus over the blobbers that hold
//! it, then fetches fragments in batches of blocks, reconstructing each
//! stripe from any `data` of the available fragments. Bytes land in a
//! `.part` file next to the destination and are renamed into place only
//! after the last block (and the optional integrity check) succeeds.

use crate::allocation::AllocationCore;
use crate::blobber::{ContentMode, DownloadShardRequest, FileLookup};
use crate::callbacks::{CompletedInfo, OpKind, StatusCallback};
use crate::marker::ReadMarker;
use crate::progress::{DownloadProgress, ProgressKey};
use crate::refs::FileRef;
use shardvault_core::{
    BlobberMask, FragmentCodec, Result, ShardCipher, ShardKey, ShardVaultError,
    ENCRYPTION_OVERHEAD,
};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What one download fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    /// The whole file body.
    Full,
    /// The thumbnail payload instead of the body.
    Thumbnail,
    /// Blocks `start..=end` of the body only (zero-based, inclusive).
    Blocks { start: u64, end: u64 },
}

/// Parameters of one download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Check the reassembled bytes against the recorded content hash.
    /// Ignored for block ranges; a sub-range cannot match the file hash.
    pub verify: bool,
    pub kind: DownloadKind,
    /// Ticket-based access for non-owners; implies lookup by path hash.
    pub auth_token: Option<String>,
    /// Lookup hash overriding path-based resolution (ticket downloads).
    pub lookup_hash: Option<String>,
    /// Key for sealed files when the caller is not the allocation owner.
    pub decrypt_key: Option<ShardKey>,
}

impl DownloadRequest {
    pub fn new(remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            verify: false,
            kind: DownloadKind::Full,
            auth_token: None,
            lookup_hash: None,
            decrypt_key: None,
        }
    }
}

/// Resolve a file reference by metadata consensus and return it along with
/// the mask of blobbers whose answer agreed.
pub(crate) async fn resolve_file_ref(
    core: &AllocationCore,
    lookup: &FileLookup,
) -> Result<(FileRef, BlobberMask)> {
    let queries = core.blobbers.iter().enumerate().map(|(i, blobber)| {
        let blobber = Arc::clone(blobber);
        let allocation_id = core.id.clone();
        let lookup = lookup.clone();
        async move { (i, blobber.file_meta(&allocation_id, &lookup).await) }
    });
    let mut groups: HashMap<(String, u64, String, u64), (FileRef, BlobberMask)> = HashMap::new();
    for (i, outcome) in futures::future::join_all(queries).await {
        match outcome {
            Ok(Some(file_ref)) => {
                let entry = groups
                    .entry(file_ref.consensus_key())
                    .or_insert_with(|| (file_ref.clone(), BlobberMask::empty()));
                entry.1.set(i);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(blobber = %core.blobbers[i].blobber_id(), error = %e, "meta query failed");
            }
        }
    }
    groups
        .into_values()
        .filter(|(_, mask)| mask.count() >= core.consensus().threshold())
        .max_by_key(|(_, mask)| mask.count())
        .ok_or(ShardVaultError::MetadataConsensus)
}

/// One download in flight.
pub struct ChunkedDownload {
    core: Arc<AllocationCore>,
    request: DownloadRequest,
    callback: Arc<dyn StatusCallback>,
}

impl ChunkedDownload {
    pub fn new(
        core: Arc<AllocationCore>,
        request: DownloadRequest,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<Self> {
        if request.lookup_hash.is_none() {
            crate::upload::validate_remote_path(&request.remote_path)?;
        }
        Ok(Self {
            core,
            request,
            callback,
        })
    }

    pub async fn run(self, token: CancellationToken) -> Result<CompletedInfo> {
        let core = Arc::clone(&self.core);
        let lookup = match &self.request.lookup_hash {
            Some(hash) => FileLookup::Hash(hash.clone()),
            None => FileLookup::Path(self.request.remote_path.clone()),
        };
        let (file_ref, mask) = resolve_file_ref(&core, &lookup).await?;
        if file_ref.is_dir() {
            return Err(ShardVaultError::InvalidPath(format!(
                "{} is a directory",
                self.request.remote_path
            )));
        }

        let cipher = self.cipher_for(&file_ref)?;
        let codec = FragmentCodec::new(core.data_shards, core.parity_shards)?;

        self.callback.started(
            &core.id,
            &self.request.remote_path,
            OpKind::Download,
            file_ref.actual_size,
        );

        if self.request.kind == DownloadKind::Thumbnail {
            return self
                .fetch_thumbnail(&file_ref, &mask, &codec, cipher.as_ref(), &token)
                .await;
        }

        let total_blocks = file_ref.num_chunks;
        let (first_block, end_block) = match self.request.kind {
            DownloadKind::Blocks { start, end } => {
                if start > end || end >= total_blocks {
                    return Err(ShardVaultError::InvalidParameter(format!(
                        "block range {}..={} outside the {} blocks of {}",
                        start, end, total_blocks, self.request.remote_path
                    )));
                }
                (start, end + 1)
            }
            _ => (0, total_blocks),
        };
        // A range covering everything is just a full download and keeps the
        // resume and verify behavior.
        let ranged = (first_block, end_block) != (0, total_blocks);

        let progress_id = ProgressKey {
            allocation_id: &core.id,
            remote_path: &self.request.remote_path,
            actual_size: file_ref.actual_size,
            chunk_size: file_ref.chunk_size as usize,
            is_update: false,
            is_repair: false,
            encrypt: file_ref.is_encrypted(),
        }
        .fingerprint();
        let part_path = part_path(&self.request.local_path);
        let mut progress = if ranged {
            // Ranges are cheap to refetch and never resume.
            DownloadProgress {
                id: progress_id.clone(),
                block_index: first_block,
                bytes_written: 0,
            }
        } else {
            core.progress
                .load_download(&progress_id)
                .filter(|p| part_path.exists())
                .unwrap_or(DownloadProgress {
                    id: progress_id.clone(),
                    block_index: 0,
                    bytes_written: 0,
                })
        };

        let mut hasher = blake3::Hasher::new();
        let mut sink = if ranged {
            File::create(&part_path)?
        } else {
            self.open_part(&part_path, &mut progress, &mut hasher)?
        };

        let base_offset = first_block * stripe_payload(&file_ref, core.data_shards);
        let mode = if ranged {
            ContentMode::Blocks
        } else {
            ContentMode::Full
        };
        let batch = core.config.num_block_downloads;
        while progress.block_index < end_block {
            if token.is_cancelled() {
                return Err(ShardVaultError::Cancelled);
            }
            let start = progress.block_index;
            let count = batch.min(end_block - start);
            let stripes = self
                .fetch_stripes(&file_ref, &mask, start, count, mode, &token)
                .await?;
            for stripe in stripes {
                let remaining = file_ref
                    .actual_size
                    .saturating_sub(base_offset + progress.bytes_written);
                let plaintext =
                    decode_stripe(&codec, cipher.as_ref(), stripe, remaining as usize)?;
                sink.write_all(&plaintext)?;
                hasher.update(&plaintext);
                progress.bytes_written += plaintext.len() as u64;
            }
            progress.block_index = start + count;
            if !ranged {
                core.progress.save_download(&progress)?;
            }
            self.callback.in_progress(
                &core.id,
                &self.request.remote_path,
                OpKind::Download,
                progress.bytes_written,
            );
        }
        sink.flush()?;
        drop(sink);

        let computed = hasher.finalize().to_hex().to_string();
        if !ranged
            && (self.request.verify || core.config.verify_download)
            && computed != file_ref.content_hash
        {
            let _ = fs::remove_file(&part_path);
            core.progress.remove(&progress_id);
            return Err(ShardVaultError::IntegrityFailed(format!(
                "content hash mismatch: expected {}, got {}",
                file_ref.content_hash, computed
            )));
        }

        fs::rename(&part_path, &self.request.local_path)?;
        core.progress.remove(&progress_id);
        info!(path = %self.request.remote_path, size = progress.bytes_written, "download complete");

        Ok(CompletedInfo {
            size: progress.bytes_written,
            mime_type: file_ref.mime_type,
            content_hash: file_ref.content_hash,
        })
    }

    fn cipher_for(&self, file_ref: &FileRef) -> Result<Option<ShardCipher>> {
        if !file_ref.is_encrypted() {
            return Ok(None);
        }
        let key = match &self.request.decrypt_key {
            Some(key) => key.clone(),
            None => self
                .core
                .owner_key
                .clone()
                .ok_or_else(|| ShardVaultError::Decrypt("no key for sealed file".to_string()))?,
        };
        if key.fingerprint_hex() != file_ref.encrypted_key {
            return Err(ShardVaultError::Decrypt(
                "key does not match the file's sealed key".to_string(),
            ));
        }
        Ok(Some(ShardCipher::new(key)?))
    }

    fn open_part(
        &self,
        part_path: &Path,
        progress: &mut DownloadProgress,
        hasher: &mut blake3::Hasher,
    ) -> Result<File> {
        if progress.block_index > 0 {
            // Rehash what an earlier run already wrote, then continue
            // appending after it.
            let mut existing = File::open(part_path)?;
            let mut buffered = Vec::new();
            existing.read_to_end(&mut buffered)?;
            if buffered.len() as u64 != progress.bytes_written {
                // Part file and record disagree; restart from scratch.
                debug!(path = %part_path.display(), "stale part file, restarting");
                progress.block_index = 0;
                progress.bytes_written = 0;
            } else {
                hasher.update(&buffered);
                return Ok(OpenOptions::new().append(true).open(part_path)?);
            }
        }
        Ok(File::create(part_path)?)
    }

    async fn fetch_thumbnail(
        self,
        file_ref: &FileRef,
        mask: &BlobberMask,
        codec: &FragmentCodec,
        cipher: Option<&ShardCipher>,
        token: &CancellationToken,
    ) -> Result<CompletedInfo> {
        let stripes = self
            .fetch_stripes(file_ref, mask, 0, 1, ContentMode::Thumbnail, token)
            .await?;
        let stripe = stripes
            .into_iter()
            .next()
            .ok_or_else(|| ShardVaultError::Corrupt("empty thumbnail response".to_string()))?;
        let plaintext = decode_stripe(codec, cipher, stripe, usize::MAX)?;
        fs::write(&self.request.local_path, &plaintext)?;
        Ok(CompletedInfo {
            size: plaintext.len() as u64,
            mime_type: file_ref.mime_type.clone(),
            content_hash: file_ref.thumbnail_hash.clone(),
        })
    }

    /// Fetch `count` blocks starting at `start` from every blobber in the
    /// mask, returning one fragment set per block. Each set holds
    /// `data + parity` positions with `None` where a blobber failed.
    async fn fetch_stripes(
        &self,
        file_ref: &FileRef,
        mask: &BlobberMask,
        start: u64,
        count: u64,
        mode: ContentMode,
        token: &CancellationToken,
    ) -> Result<Vec<Vec<Option<Vec<u8>>>>> {
        let core = &self.core;
        let total = core.data_shards + core.parity_shards;
        let fetches = mask.iter().map(|i| {
            let blobber = Arc::clone(&core.blobbers[i]);
            let allocation_id = core.id.clone();
            let mut marker = ReadMarker {
                allocation_id: core.id.clone(),
                client_id: core.keys.client_id().to_string(),
                blobber_id: blobber.blobber_id().to_string(),
                counter: core.next_read_counter(),
                timestamp: chrono::Utc::now().timestamp(),
                signature: String::new(),
            };
            marker.sign(&core.keys);
            let req = DownloadShardRequest {
                read_marker: marker,
                path_hash: file_ref.lookup_hash.clone(),
                block_num: start,
                num_blocks: count,
                content_mode: mode,
                auth_token: self.request.auth_token.clone(),
            };
            async move { (i, blobber.download_shard(&allocation_id, req).await) }
        });

        let mut stripes: Vec<Vec<Option<Vec<u8>>>> =
            (0..count).map(|_| vec![None; total]).collect();
        let mut successes = 0usize;
        // Cancellation must interrupt the in-flight batch, not just the gap
        // between batches.
        let outcomes = tokio::select! {
            _ = token.cancelled() => return Err(ShardVaultError::Cancelled),
            outcomes = futures::future::join_all(fetches) => outcomes,
        };
        for (i, outcome) in outcomes {
            match outcome {
                Ok(response) => {
                    successes += 1;
                    for (block, fragment) in response.fragments.into_iter().enumerate() {
                        if let Some(stripe) = stripes.get_mut(block) {
                            stripe[i] = Some(fragment);
                        }
                    }
                }
                Err(e) => {
                    debug!(blobber = %core.blobbers[i].blobber_id(), error = %e, "block fetch failed");
                }
            }
        }
        if successes < core.data_shards {
            return Err(ShardVaultError::InsufficientFragments {
                available: successes,
                required: core.data_shards,
            });
        }
        Ok(stripes)
    }
}

/// Logical bytes carried by one full block stripe of the file.
fn stripe_payload(file_ref: &FileRef, data_shards: usize) -> u64 {
    let fragment = file_ref.chunk_size as usize;
    let payload = if file_ref.is_encrypted() {
        fragment.saturating_sub(ENCRYPTION_OVERHEAD)
    } else {
        fragment
    };
    (payload * data_shards) as u64
}

fn part_path(local_path: &Path) -> PathBuf {
    let mut name = local_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    local_path.with_file_name(name)
}

/// Reconstruct one stripe, open sealed fragments, and concatenate the data
/// positions, truncated to `limit` plaintext bytes.
fn decode_stripe(
    codec: &FragmentCodec,
    cipher: Option<&ShardCipher>,
    mut fragments: Vec<Option<Vec<u8>>>,
    limit: usize,
) -> Result<Vec<u8>> {
    let present = fragments.iter().flatten().next();
    // A zero-length stripe is the trailing final-chunk marker.
    if present.map(|f| f.is_empty()).unwrap_or(true) {
        return Ok(Vec::new());
    }
    codec.reconstruct(&mut fragments)?;
    let mut plaintext = Vec::new();
    for fragment in fragments.into_iter().take(codec.data_shards()) {
        let fragment =
            fragment.ok_or_else(|| ShardVaultError::Corrupt("reconstruction hole".to_string()))?;
        match cipher {
            Some(cipher) => plaintext.extend_from_slice(&cipher.open(&fragment)?),
            None => plaintext.extend_from_slice(&fragment),
        }
    }
    plaintext.truncate(limit);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/out/file.bin")),
            Path::new("/tmp/out/file.bin.part")
        );
    }

    #[test]
    fn test_decode_stripe_plain() {
        let codec = FragmentCodec::new(2, 1).unwrap();
        let data = codec.split(b"hello world!", 6);
        let encoded = codec.encode(data).unwrap();
        let mut fragments: Vec<Option<Vec<u8>>> = encoded.into_iter().map(Some).collect();
        // Lose one data fragment; parity must cover it.
        fragments[0] = None;
        let plaintext = decode_stripe(&codec, None, fragments, 12).unwrap();
        assert_eq!(&plaintext, b"hello world!");
    }

    #[test]
    fn test_decode_stripe_empty_marker() {
        let codec = FragmentCodec::new(2, 1).unwrap();
        let fragments = vec![Some(Vec::new()), Some(Vec::new()), None];
        assert!(decode_stripe(&codec, None, fragments, 100)
            .unwrap()
            .is_empty());
    }
}
