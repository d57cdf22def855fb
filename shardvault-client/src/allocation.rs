//! Allocation engine
//!
//! An `Allocation` owns the client-side view of one storage allocation: its
//! blobber set, signing identity, and a dispatcher task that spawns each
//! queued transfer on its own worker. Metadata operations (list, meta,
//! stats, delete, rename, copy, move, mkdir, share) run inline; uploads and
//! downloads are enqueued as jobs and report through their status
//! callbacks.

use crate::auth::AuthTicket;
use crate::blobber::{BlobberApi, FileLookup};
use crate::callbacks::{OpKind, StatusCallback};
use crate::config::EngineConfig;
use crate::download::{resolve_file_ref, ChunkedDownload, DownloadKind, DownloadRequest};
use crate::marker::{next_allocation_root, ClientKeys, WriteMarker};
use crate::progress::ProgressStore;
use crate::refs::{FileRef, FileStats, ListResult};
use crate::upload::{validate_remote_path, ChunkedUpload, UploadRequest};
use crate::wm_mutex::WriteMarkerMutex;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use shardvault_core::{
    BlobberMask, Consensus, ContentHash, Result, ShardCipher, ShardKey, ShardVaultError,
    MAX_BLOBBERS,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const JOB_QUEUE_DEPTH: usize = 10;
const METADATA_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to construct an allocation handle.
pub struct AllocationParams {
    pub id: String,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub blobbers: Vec<Arc<dyn BlobberApi>>,
    pub keys: ClientKeys,
    /// Per-allocation key for sealed files; `None` disables encryption.
    pub owner_key: Option<ShardKey>,
    pub config: EngineConfig,
}

/// Shared, immutable-ish state every pipeline borrows.
pub struct AllocationCore {
    pub id: String,
    pub keys: ClientKeys,
    pub data_shards: usize,
    pub parity_shards: usize,
    pub blobbers: Vec<Arc<dyn BlobberApi>>,
    pub config: EngineConfig,
    pub owner_key: Option<ShardKey>,
    pub progress: ProgressStore,
    allocation_root: Mutex<String>,
    read_counter: AtomicU64,
    last_wm_timestamp: AtomicI64,
}

impl AllocationCore {
    pub fn consensus(&self) -> Consensus {
        Consensus::new(self.data_shards, self.parity_shards)
    }

    pub fn consensus_for_mask(&self, mask: &BlobberMask) -> Consensus {
        Consensus::with_full(self.data_shards, self.parity_shards, mask.count())
    }

    pub fn allocation_root(&self) -> String {
        self.allocation_root.lock().clone()
    }

    pub fn set_allocation_root(&self, root: String) {
        *self.allocation_root.lock() = root;
    }

    /// Strictly increasing read-marker counter, shared across blobbers.
    pub fn next_read_counter(&self) -> u64 {
        self.read_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Write-marker timestamp, strictly greater than any previously issued
    /// even when commits land within the same second.
    pub fn next_wm_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp();
        let mut prev = self.last_wm_timestamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_wm_timestamp.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    pub fn new_connection_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn shard_cipher(&self) -> Result<ShardCipher> {
        let key = self.owner_key.clone().ok_or_else(|| {
            ShardVaultError::InvalidParameter("allocation has no encryption key".to_string())
        })?;
        ShardCipher::new(key)
    }
}

type Job = BoxFuture<'static, ()>;

struct Dispatcher {
    uploads: mpsc::Sender<Job>,
    downloads: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

/// Client-side handle of one allocation.
pub struct Allocation {
    core: Arc<AllocationCore>,
    dispatcher: Mutex<Option<Dispatcher>>,
    active_downloads: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.core.id)
            .finish_non_exhaustive()
    }
}

impl Allocation {
    pub fn new(params: AllocationParams) -> Result<Arc<Self>> {
        let total = params.data_shards + params.parity_shards;
        if params.data_shards == 0 {
            return Err(ShardVaultError::InvalidParameter(
                "data_shards must be > 0".to_string(),
            ));
        }
        if total > MAX_BLOBBERS {
            return Err(ShardVaultError::InvalidParameter(format!(
                "{} shards exceeds the {} blobber limit",
                total, MAX_BLOBBERS
            )));
        }
        if params.blobbers.len() < total {
            return Err(ShardVaultError::NoBlobbers {
                have: params.blobbers.len(),
                need: total,
            });
        }
        let config = params.config.normalized();
        let progress = ProgressStore::new(&config.progress_dir)?;
        let core = Arc::new(AllocationCore {
            id: params.id,
            keys: params.keys,
            data_shards: params.data_shards,
            parity_shards: params.parity_shards,
            blobbers: params.blobbers,
            config,
            owner_key: params.owner_key,
            progress,
            allocation_root: Mutex::new(String::new()),
            read_counter: AtomicU64::new(0),
            last_wm_timestamp: AtomicI64::new(0),
        });
        Ok(Arc::new(Self {
            core,
            dispatcher: Mutex::new(None),
            active_downloads: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn core(&self) -> &Arc<AllocationCore> {
        &self.core
    }

    /// Start the dispatcher task. Calling this again is a no-op; enqueueing
    /// a transfer starts it implicitly.
    pub fn start(&self) {
        let mut slot = self.dispatcher.lock();
        if slot.is_some() {
            return;
        }
        let (upload_tx, mut upload_rx) = mpsc::channel::<Job>(JOB_QUEUE_DEPTH);
        let (download_tx, mut download_rx) = mpsc::channel::<Job>(JOB_QUEUE_DEPTH);
        let shutdown = self.shutdown.clone();
        let allocation_id = self.core.id.clone();
        let handle = tokio::spawn(async move {
            debug!(allocation = %allocation_id, "dispatcher started");
            // Accepted jobs run on their own workers; a stalled transfer
            // must not hold up the queues behind it.
            let mut workers = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(job) = upload_rx.recv() => {
                        workers.spawn(job);
                    }
                    Some(job) = download_rx.recv() => {
                        workers.spawn(job);
                    }
                    Some(_) = workers.join_next(), if !workers.is_empty() => {}
                    else => break,
                }
            }
            // Workers observe the cancelled token at their next await point.
            while workers.join_next().await.is_some() {}
            debug!(allocation = %allocation_id, "dispatcher stopped");
        });
        *slot = Some(Dispatcher {
            uploads: upload_tx,
            downloads: download_tx,
            handle,
        });
    }

    /// Stop the dispatcher and cancel every transfer in flight.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, token) in self.active_downloads.lock().drain() {
            token.cancel();
        }
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            drop(dispatcher.uploads);
            drop(dispatcher.downloads);
            if let Err(e) = dispatcher.handle.await {
                warn!(error = %e, "dispatcher join failed");
            }
        }
    }

    fn queue(&self, downloads: bool) -> Result<mpsc::Sender<Job>> {
        if self.shutdown.is_cancelled() {
            return Err(ShardVaultError::NotInitialized);
        }
        self.start();
        let slot = self.dispatcher.lock();
        let dispatcher = slot.as_ref().ok_or(ShardVaultError::NotInitialized)?;
        Ok(if downloads {
            dispatcher.downloads.clone()
        } else {
            dispatcher.uploads.clone()
        })
    }

    async fn enqueue(&self, job: Job, downloads: bool) -> Result<()> {
        self.queue(downloads)?
            .send(job)
            .await
            .map_err(|_| ShardVaultError::NotInitialized)
    }

    /// Queue an upload of a new file. Fails upfront if the remote path
    /// already exists on a threshold of blobbers.
    pub async fn upload_file(
        &self,
        request: UploadRequest,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        if request.is_update {
            return Err(ShardVaultError::InvalidParameter(
                "update_file handles updates".to_string(),
            ));
        }
        if self.exists(&request.remote_path).await? {
            return Err(ShardVaultError::InvalidPath(format!(
                "{} already exists",
                request.remote_path
            )));
        }
        self.enqueue_upload(request, callback).await
    }

    /// Queue an in-place update of an existing file.
    pub async fn update_file(
        &self,
        mut request: UploadRequest,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        request.is_update = true;
        if !self.exists(&request.remote_path).await? {
            return Err(ShardVaultError::InvalidPath(format!(
                "{} does not exist",
                request.remote_path
            )));
        }
        self.enqueue_upload(request, callback).await
    }

    async fn enqueue_upload(
        &self,
        request: UploadRequest,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        let upload = ChunkedUpload::new(Arc::clone(&self.core), request.clone(), Arc::clone(&callback))?;
        let token = self.shutdown.child_token();
        let core = Arc::clone(&self.core);
        let op = upload.op_kind();
        let job: Job = Box::pin(async move {
            match upload.run(token).await {
                Ok(info) => callback.completed(&core.id, &request.remote_path, op, &info),
                Err(e) => callback.error(&core.id, &request.remote_path, op, &e),
            }
        });
        self.enqueue(job, false).await
    }

    /// Queue a download to a local path.
    pub async fn download_file(
        &self,
        request: DownloadRequest,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        let remote_path = request.remote_path.clone();
        {
            let active = self.active_downloads.lock();
            if active.contains_key(&remote_path) {
                return Err(ShardVaultError::InvalidParameter(format!(
                    "download already in progress for {}",
                    remote_path
                )));
            }
        }
        let download = ChunkedDownload::new(Arc::clone(&self.core), request, Arc::clone(&callback))?;
        let token = self.shutdown.child_token();
        self.active_downloads
            .lock()
            .insert(remote_path.clone(), token.clone());

        let core = Arc::clone(&self.core);
        let active = Arc::clone(&self.active_downloads);
        let job: Job = Box::pin(async move {
            let outcome = download.run(token).await;
            active.lock().remove(&remote_path);
            match outcome {
                Ok(info) => callback.completed(&core.id, &remote_path, OpKind::Download, &info),
                Err(e) => callback.error(&core.id, &remote_path, OpKind::Download, &e),
            }
        });
        self.enqueue(job, true).await
    }

    /// Queue a thumbnail download; the file body is never fetched.
    pub async fn download_thumbnail(
        &self,
        mut request: DownloadRequest,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        request.kind = DownloadKind::Thumbnail;
        self.download_file(request, callback).await
    }

    /// Queue a download of blocks `start..=end` only (zero-based,
    /// inclusive); the local file receives just that range.
    pub async fn download_blocks(
        &self,
        mut request: DownloadRequest,
        start: u64,
        end: u64,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        request.kind = DownloadKind::Blocks { start, end };
        self.download_file(request, callback).await
    }

    /// Cancel a queued or running download by remote path.
    pub fn cancel_download(&self, remote_path: &str) -> Result<()> {
        match self.active_downloads.lock().get(remote_path) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(ShardVaultError::InvalidParameter(format!(
                "no active download for {}",
                remote_path
            ))),
        }
    }

    /// Re-upload a file's fragments to the blobbers that lost them. The
    /// local copy must match the committed content hash.
    pub async fn repair_file(
        &self,
        local_path: PathBuf,
        remote_path: String,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        let (file_ref, holder_mask) =
            resolve_file_ref(&self.core, &FileLookup::Path(remote_path.clone())).await?;
        let mut repair_mask = BlobberMask::empty();
        for i in 0..self.core.blobbers.len() {
            if !holder_mask.is_set(i) {
                repair_mask.set(i);
            }
        }
        if repair_mask.is_empty() {
            info!(path = %remote_path, "nothing to repair");
            callback.repair_completed(0);
            return Ok(());
        }

        let local = std::fs::read(&local_path)?;
        let local_hash = ContentHash::compute(&local).to_hex();
        if local_hash != file_ref.content_hash {
            return Err(ShardVaultError::ContentHashMismatch {
                expected: file_ref.content_hash.clone(),
                actual: local_hash,
            });
        }

        let request = UploadRequest {
            local_path,
            remote_path: remote_path.clone(),
            mime_type: Some(file_ref.mime_type.clone()),
            encrypt: file_ref.is_encrypted(),
            is_update: false,
            thumbnail_path: None,
        };
        let upload = ChunkedUpload::for_repair(
            Arc::clone(&self.core),
            request,
            repair_mask,
            Arc::clone(&callback),
        )?;
        let token = self.shutdown.child_token();
        let core = Arc::clone(&self.core);
        let job: Job = Box::pin(async move {
            match upload.run(token).await {
                Ok(info) => {
                    callback.completed(&core.id, &remote_path, OpKind::Repair, &info);
                    callback.repair_completed(1);
                }
                Err(e) => callback.error(&core.id, &remote_path, OpKind::Repair, &e),
            }
        });
        self.enqueue(job, false).await
    }

    /// Resolve a file's metadata by consensus.
    pub async fn file_meta(&self, remote_path: &str) -> Result<FileRef> {
        validate_remote_path(remote_path)?;
        let (file_ref, _) =
            resolve_file_ref(&self.core, &FileLookup::Path(remote_path.to_string())).await?;
        Ok(file_ref)
    }

    async fn exists(&self, remote_path: &str) -> Result<bool> {
        match resolve_file_ref(&self.core, &FileLookup::Path(remote_path.to_string())).await {
            Ok(_) => Ok(true),
            Err(ShardVaultError::MetadataConsensus) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List one directory level, keeping entries that a threshold of
    /// blobbers agree on.
    pub async fn list_dir(&self, remote_path: &str) -> Result<ListResult> {
        validate_remote_path(remote_path)?;
        let queries = self.core.blobbers.iter().map(|blobber| {
            let blobber = Arc::clone(blobber);
            let allocation_id = self.core.id.clone();
            let path = remote_path.to_string();
            async move { blobber.list_dir(&allocation_id, &path).await }
        });
        let threshold = self.core.consensus().threshold();
        let mut counts: HashMap<String, (FileRef, usize)> = HashMap::new();
        let mut responses = 0usize;
        for outcome in futures::future::join_all(queries).await {
            match outcome {
                Ok(listing) => {
                    responses += 1;
                    for child in listing.children {
                        counts
                            .entry(child.path.clone())
                            .or_insert_with(|| (child, 0))
                            .1 += 1;
                    }
                }
                Err(e) => debug!(error = %e, "list query failed"),
            }
        }
        if responses < threshold {
            return Err(ShardVaultError::MetadataConsensus);
        }
        let mut children: Vec<FileRef> = counts
            .into_values()
            .filter(|(_, count)| *count >= threshold)
            .map(|(child, _)| child)
            .collect();
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(ListResult {
            path: remote_path.to_string(),
            children,
        })
    }

    /// Per-blobber statistics for one file.
    pub async fn file_stats(&self, remote_path: &str) -> Result<HashMap<String, FileStats>> {
        validate_remote_path(remote_path)?;
        let queries = self.core.blobbers.iter().map(|blobber| {
            let blobber = Arc::clone(blobber);
            let allocation_id = self.core.id.clone();
            let path = remote_path.to_string();
            async move {
                let id = blobber.blobber_id().to_string();
                (id, blobber.file_stats(&allocation_id, &path).await)
            }
        });
        let mut stats = HashMap::new();
        for (id, outcome) in futures::future::join_all(queries).await {
            match outcome {
                Ok(s) => {
                    stats.insert(id, s);
                }
                Err(e) => debug!(blobber = %id, error = %e, "stats query failed"),
            }
        }
        if stats.is_empty() {
            return Err(ShardVaultError::MetadataConsensus);
        }
        Ok(stats)
    }

    pub async fn delete_file(&self, remote_path: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        let path = remote_path.to_string();
        self.metadata_commit("delete", &path.clone(), move |blobber, allocation_id, conn| {
            let path = path.clone();
            Box::pin(async move { blobber.delete_file(&allocation_id, &conn, &path).await })
        })
        .await
    }

    pub async fn rename(&self, remote_path: &str, new_name: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        if new_name.is_empty() || new_name.contains('/') {
            return Err(ShardVaultError::InvalidPath(new_name.to_string()));
        }
        let path = remote_path.to_string();
        let new_name = new_name.to_string();
        let tag = format!("{}->{}", remote_path, new_name);
        self.metadata_commit("rename", &tag, move |blobber, allocation_id, conn| {
            let path = path.clone();
            let new_name = new_name.clone();
            Box::pin(async move {
                blobber
                    .rename_object(&allocation_id, &conn, &path, &new_name)
                    .await
            })
        })
        .await
    }

    pub async fn copy(&self, remote_path: &str, dest_dir: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        validate_remote_path(dest_dir)?;
        let path = remote_path.to_string();
        let dest = dest_dir.to_string();
        let tag = format!("{}->{}", remote_path, dest_dir);
        self.metadata_commit("copy", &tag, move |blobber, allocation_id, conn| {
            let path = path.clone();
            let dest = dest.clone();
            Box::pin(async move {
                blobber.copy_object(&allocation_id, &conn, &path, &dest).await
            })
        })
        .await
    }

    pub async fn r#move(&self, remote_path: &str, dest_dir: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        validate_remote_path(dest_dir)?;
        let path = remote_path.to_string();
        let dest = dest_dir.to_string();
        let tag = format!("{}->{}", remote_path, dest_dir);
        self.metadata_commit("move", &tag, move |blobber, allocation_id, conn| {
            let path = path.clone();
            let dest = dest.clone();
            Box::pin(async move {
                blobber.move_object(&allocation_id, &conn, &path, &dest).await
            })
        })
        .await
    }

    pub async fn create_dir(&self, remote_path: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        let path = remote_path.to_string();
        self.metadata_commit("mkdir", &path.clone(), move |blobber, allocation_id, conn| {
            let path = path.clone();
            Box::pin(async move { blobber.create_dir(&allocation_id, &conn, &path).await })
        })
        .await
    }

    /// Create a signed auth ticket for a file, optionally expiring at
    /// `expiration` (UNIX seconds, 0 for none). Sealed files embed the key
    /// material the recipient needs.
    pub async fn share(&self, remote_path: &str, expiration: i64) -> Result<String> {
        let (file_ref, _) =
            resolve_file_ref(&self.core, &FileLookup::Path(remote_path.to_string())).await?;
        let re_encryption_key = if file_ref.is_encrypted() {
            let key = self.core.owner_key.as_ref().ok_or_else(|| {
                ShardVaultError::InvalidParameter("allocation has no encryption key".to_string())
            })?;
            hex::encode(key.as_bytes())
        } else {
            String::new()
        };
        let mut ticket = AuthTicket {
            allocation_id: self.core.id.clone(),
            owner_id: self.core.keys.client_id().to_string(),
            file_name: file_ref.name.clone(),
            file_path_hash: file_ref.lookup_hash.clone(),
            re_encryption_key,
            expiration,
            timestamp: Utc::now().timestamp(),
            signature: String::new(),
        };
        ticket.sign(&self.core.keys);
        ticket.encode()
    }

    /// Queue a download authorized by an auth ticket rather than ownership.
    pub async fn download_from_ticket(
        &self,
        encoded_ticket: &str,
        local_path: PathBuf,
        callback: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        let ticket = AuthTicket::decode(encoded_ticket)?;
        ticket.verify(Utc::now().timestamp())?;
        if ticket.allocation_id != self.core.id {
            return Err(ShardVaultError::AuthTicket(
                "ticket is for another allocation".to_string(),
            ));
        }
        let decrypt_key = if ticket.re_encryption_key.is_empty() {
            None
        } else {
            let raw = hex::decode(&ticket.re_encryption_key)
                .map_err(|e| ShardVaultError::AuthTicket(format!("key material: {}", e)))?;
            Some(ShardKey::from_slice(&raw)?)
        };
        let request = DownloadRequest {
            remote_path: format!("/{}", ticket.file_name),
            local_path,
            verify: false,
            kind: DownloadKind::Full,
            auth_token: Some(encoded_ticket.to_string()),
            lookup_hash: Some(ticket.file_path_hash.clone()),
            decrypt_key,
        };
        self.download_file(request, callback).await
    }

    /// Stage one metadata operation on every blobber, then commit it under
    /// the write-marker mutex.
    async fn metadata_commit<F>(&self, op: &str, tag: &str, stage: F) -> Result<()>
    where
        F: Fn(Arc<dyn BlobberApi>, String, String) -> BoxFuture<'static, Result<()>>,
    {
        let core = &self.core;
        let connection_id = core.new_connection_id();
        let mut mask = BlobberMask::all(core.blobbers.len());
        let stages = core.blobbers.iter().enumerate().map(|(i, blobber)| {
            let fut = stage(
                Arc::clone(blobber),
                core.id.clone(),
                connection_id.clone(),
            );
            async move { (i, fut.await) }
        });
        let mut consensus = core.consensus();
        for (i, outcome) in futures::future::join_all(stages).await {
            match outcome {
                Ok(()) => consensus.add_success(),
                Err(e) => {
                    debug!(blobber = %core.blobbers[i].blobber_id(), op, error = %e, "stage failed");
                    mask.clear(i);
                }
            }
        }
        consensus.check()?;

        let mutex = WriteMarkerMutex::new(
            core.id.clone(),
            core.blobbers.clone(),
            consensus.threshold(),
        );
        let guard = mutex.lock(&connection_id, METADATA_LOCK_TIMEOUT).await?;

        let prev_root = core.allocation_root();
        let next_root = next_allocation_root(&prev_root, &[format!("{}:{}", op, tag)]);
        let timestamp = core.next_wm_timestamp();
        let commits = mask.iter().map(|i| {
            let blobber = Arc::clone(&core.blobbers[i]);
            let mut marker = WriteMarker {
                allocation_id: core.id.clone(),
                client_id: core.keys.client_id().to_string(),
                blobber_id: blobber.blobber_id().to_string(),
                prev_allocation_root: prev_root.clone(),
                allocation_root: next_root.clone(),
                size: 0,
                timestamp,
                signature: String::new(),
            };
            marker.sign(&core.keys);
            let allocation_id = core.id.clone();
            let conn = connection_id.clone();
            async move { (i, blobber.commit(&allocation_id, &conn, &marker).await) }
        });
        let mut commit_consensus = core.consensus();
        for (i, outcome) in futures::future::join_all(commits).await {
            match outcome {
                Ok(_) => commit_consensus.add_success(),
                Err(e) => {
                    debug!(blobber = %core.blobbers[i].blobber_id(), op, error = %e, "commit failed")
                }
            }
        }
        mutex.unlock(&connection_id, guard).await;
        commit_consensus.check()?;
        core.set_allocation_root(next_root);
        info!(op, tag, "metadata operation committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBlobber;

    fn params(blobbers: Vec<Arc<MockBlobber>>) -> AllocationParams {
        AllocationParams {
            id: "alloc".into(),
            data_shards: 2,
            parity_shards: 1,
            blobbers: blobbers
                .into_iter()
                .map(|b| b as Arc<dyn BlobberApi>)
                .collect(),
            keys: ClientKeys::generate(),
            owner_key: Some(ShardKey::generate()),
            config: EngineConfig {
                progress_dir: std::env::temp_dir().join("shardvault-test-progress"),
                ..EngineConfig::default()
            },
        }
    }

    #[test]
    fn test_new_rejects_short_blobber_set() {
        let blobbers = MockBlobber::cluster(2, "alloc");
        let err = Allocation::new(params(blobbers)).unwrap_err();
        assert!(matches!(err, ShardVaultError::NoBlobbers { have: 2, need: 3 }));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let allocation = Allocation::new(params(MockBlobber::cluster(3, "alloc"))).unwrap();
        allocation.start();
        allocation.start();
        allocation.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let allocation = Allocation::new(params(MockBlobber::cluster(3, "alloc"))).unwrap();
        allocation.start();
        allocation.shutdown().await;
        let err = allocation
            .cancel_download("/nope")
            .unwrap_err();
        assert!(matches!(err, ShardVaultError::InvalidParameter(_)));
        let err = allocation.queue(false).unwrap_err();
        assert!(matches!(err, ShardVaultError::NotInitialized));
    }

    #[tokio::test]
    async fn test_create_dir_and_list() {
        let allocation = Allocation::new(params(MockBlobber::cluster(3, "alloc"))).unwrap();
        allocation.create_dir("/docs").await.unwrap();
        let listing = allocation.list_dir("/").await.unwrap();
        assert_eq!(listing.children.len(), 1);
        assert_eq!(listing.children[0].path, "/docs");
        assert!(listing.children[0].is_dir());
        allocation.shutdown().await;
    }

    #[test]
    fn test_wm_timestamp_strictly_increases() {
        let allocation = Allocation::new(params(MockBlobber::cluster(3, "alloc"))).unwrap();
        let a = allocation.core.next_wm_timestamp();
        let b = allocation.core.next_wm_timestamp();
        assert!(b > a);
    }
}
