//! In-memory blobber
//!
//! `MockBlobber` implements the full `BlobberApi` against process-local
//! state so pipeline behavior can be exercised without a network. It
//! enforces the same invariants a real blobber would: staged writes become
//! visible only on commit, write markers must chain allocation roots with
//! strictly increasing timestamps, and read-marker counters must strictly
//! increase per client. A commit applies the uploads whose final chunk has
//! arrived and keeps partially staged uploads on their connection for a
//! later commit. Failure knobs let tests knock individual providers out,
//! hand back corrupted shards, or slow every transfer down.

use crate::blobber::{
    BlobberApi, ContentMode, DownloadShardRequest, DownloadShardResponse, FileLookup,
    UploadShardRequest,
};
use crate::marker::WriteMarker;
use crate::refs::{
    lookup_hash, CommitResult, FileRef, FileStats, ListResult, UploadShardResult, WmLockResult,
    WmLockStatus, DIRECTORY, FILE,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use shardvault_core::{fragment_hash, Result, ShardVaultError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredFile {
    meta: FileRef,
    /// One fragment per chunk, in chunk order.
    fragments: Vec<Vec<u8>>,
    thumbnail: Option<Vec<u8>>,
    num_updates: u64,
    num_block_downloads: u64,
}

#[derive(Debug, Default)]
struct StagedUpload {
    filename: String,
    fragments: BTreeMap<usize, Vec<u8>>,
    challenge_hashes: BTreeMap<usize, String>,
    actual_size: u64,
    mime_type: String,
    encrypted_key: String,
    actual_hash: String,
    thumbnail: Option<Vec<u8>>,
    thumbnail_hash: String,
    final_seen: bool,
}

#[derive(Debug)]
enum StagedOp {
    Delete { path: String },
    Rename { path: String, new_name: String },
    Copy { path: String, dest_dir: String },
    Move { path: String, dest_dir: String },
    Mkdir { path: String },
}

#[derive(Debug, Default)]
struct Connection {
    uploads: BTreeMap<String, StagedUpload>,
    ops: Vec<StagedOp>,
}

#[derive(Default)]
struct State {
    files: HashMap<String, StoredFile>,
    dirs: HashMap<String, FileRef>,
    connections: HashMap<String, Connection>,
    allocation_root: String,
    last_wm_timestamp: i64,
    read_counters: HashMap<String, u64>,
    lock_holder: Option<String>,
    commits: u64,
}

/// Local blobber with failure-injection knobs for tests.
pub struct MockBlobber {
    id: String,
    allocation_id: String,
    state: Mutex<State>,
    /// All operations fail with a network error while set.
    pub offline: AtomicBool,
    /// Shard uploads fail while set; other operations still work.
    pub fail_uploads: AtomicBool,
    /// Downloads return bit-flipped fragments while set.
    pub corrupt_downloads: AtomicBool,
    /// Lock requests report `Pending` this many more times.
    pub pending_locks: AtomicU32,
    /// Lock requests report `Failed` while set.
    pub deny_locks: AtomicBool,
    /// Shard uploads and downloads sleep this long before answering.
    pub latency_ms: AtomicU64,
}

impl MockBlobber {
    pub fn new(id: impl Into<String>, allocation_id: impl Into<String>) -> Arc<Self> {
        let blobber = Self {
            id: id.into(),
            allocation_id: allocation_id.into(),
            state: Mutex::new(State::default()),
            offline: AtomicBool::new(false),
            fail_uploads: AtomicBool::new(false),
            corrupt_downloads: AtomicBool::new(false),
            pending_locks: AtomicU32::new(0),
            deny_locks: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
        };
        blobber.state.lock().dirs.insert(
            "/".to_string(),
            dir_ref(&blobber.allocation_id, "/".to_string()),
        );
        Arc::new(blobber)
    }

    /// Spin up `count` blobbers for one allocation.
    pub fn cluster(count: usize, allocation_id: &str) -> Vec<Arc<Self>> {
        (0..count)
            .map(|i| Self::new(format!("blobber-{}", i), allocation_id))
            .collect()
    }

    pub fn allocation_root(&self) -> String {
        self.state.lock().allocation_root.clone()
    }

    /// Number of committed regular files.
    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state.lock().files.contains_key(path)
    }

    /// Drop a committed file without going through a connection, simulating
    /// data loss on this provider.
    pub fn lose_file(&self, path: &str) {
        self.state.lock().files.remove(path);
    }

    /// Number of write markers accepted so far.
    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            Err(ShardVaultError::Network(format!(
                "{}: connection refused",
                self.id
            )))
        } else {
            Ok(())
        }
    }

    fn check_allocation(&self, allocation_id: &str) -> Result<()> {
        if allocation_id != self.allocation_id {
            return Err(ShardVaultError::Network(format!(
                "{}: unknown allocation {}",
                self.id, allocation_id
            )));
        }
        Ok(())
    }

    fn ensure_parent_dirs(state: &mut State, allocation_id: &str, path: &str) {
        let mut dir = parent_dir(path);
        loop {
            if state.dirs.contains_key(&dir) {
                break;
            }
            state
                .dirs
                .insert(dir.clone(), dir_ref(allocation_id, dir.clone()));
            if dir == "/" {
                break;
            }
            dir = parent_dir(&dir);
        }
    }

    fn apply_connection(state: &mut State, allocation_id: &str, conn: Connection) {
        for (path, staged) in conn.uploads {
            let fragments: Vec<Vec<u8>> = staged.fragments.into_values().collect();
            let size: u64 = fragments.iter().map(|f| f.len() as u64).sum();
            let now = Utc::now().to_rfc3339();
            let num_updates = state
                .files
                .get(&path)
                .map(|f| f.num_updates + 1)
                .unwrap_or(1);
            let created_at = state
                .files
                .get(&path)
                .map(|f| f.meta.created_at.clone())
                .unwrap_or_else(|| now.clone());
            Self::ensure_parent_dirs(state, allocation_id, &path);
            let meta = FileRef {
                name: staged.filename,
                path: path.clone(),
                lookup_hash: lookup_hash(allocation_id, &path),
                kind: FILE.to_string(),
                size,
                actual_size: staged.actual_size,
                mime_type: staged.mime_type,
                content_hash: staged.actual_hash,
                num_chunks: fragments.len() as u64,
                chunk_size: fragments.first().map(|f| f.len() as u64).unwrap_or(0),
                encrypted_key: staged.encrypted_key,
                thumbnail_size: staged.thumbnail.as_ref().map(|t| t.len() as u64).unwrap_or(0),
                thumbnail_hash: staged.thumbnail_hash,
                created_at,
                updated_at: now,
            };
            state.files.insert(
                path,
                StoredFile {
                    meta,
                    fragments,
                    thumbnail: staged.thumbnail,
                    num_updates,
                    num_block_downloads: 0,
                },
            );
        }
        for op in conn.ops {
            match op {
                StagedOp::Delete { path } => {
                    state.files.remove(&path);
                    // Deleting a directory takes everything under it along.
                    if state.dirs.remove(&path).is_some() {
                        let prefix = format!("{}/", path);
                        state.files.retain(|p, _| !p.starts_with(&prefix));
                        state.dirs.retain(|p, _| !p.starts_with(&prefix));
                    }
                }
                StagedOp::Rename { path, new_name } => {
                    if let Some(mut file) = state.files.remove(&path) {
                        let new_path = format!("{}{}", parent_prefix(&path), new_name);
                        file.meta.name = new_name;
                        file.meta.path = new_path.clone();
                        file.meta.lookup_hash = lookup_hash(allocation_id, &new_path);
                        state.files.insert(new_path, file);
                    }
                }
                StagedOp::Copy { path, dest_dir } => {
                    if let Some(file) = state.files.get(&path).cloned() {
                        let new_path = join_path(&dest_dir, &file.meta.name);
                        let mut copy = file;
                        copy.meta.path = new_path.clone();
                        copy.meta.lookup_hash = lookup_hash(allocation_id, &new_path);
                        Self::ensure_parent_dirs(state, allocation_id, &new_path);
                        state.files.insert(new_path, copy);
                    }
                }
                StagedOp::Move { path, dest_dir } => {
                    if let Some(mut file) = state.files.remove(&path) {
                        let new_path = join_path(&dest_dir, &file.meta.name);
                        file.meta.path = new_path.clone();
                        file.meta.lookup_hash = lookup_hash(allocation_id, &new_path);
                        Self::ensure_parent_dirs(state, allocation_id, &new_path);
                        state.files.insert(new_path, file);
                    }
                }
                StagedOp::Mkdir { path } => {
                    Self::ensure_parent_dirs(state, allocation_id, &join_path(&path, "x"));
                    state
                        .dirs
                        .entry(path.clone())
                        .or_insert_with(|| dir_ref(allocation_id, path));
                }
            }
        }
    }
}

fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => "/".to_string(),
    }
}

fn parent_prefix(path: &str) -> String {
    let dir = parent_dir(path);
    if dir == "/" {
        dir
    } else {
        format!("{}/", dir)
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

fn dir_ref(allocation_id: &str, path: String) -> FileRef {
    let now = Utc::now().to_rfc3339();
    let name = path.rsplit('/').next().unwrap_or("").to_string();
    FileRef {
        name: if path == "/" { "/".to_string() } else { name },
        lookup_hash: lookup_hash(allocation_id, &path),
        path,
        kind: DIRECTORY.to_string(),
        size: 0,
        actual_size: 0,
        mime_type: String::new(),
        content_hash: String::new(),
        num_chunks: 0,
        chunk_size: 0,
        encrypted_key: String::new(),
        thumbnail_size: 0,
        thumbnail_hash: String::new(),
        created_at: now.clone(),
        updated_at: now,
    }
}

#[async_trait]
impl BlobberApi for MockBlobber {
    fn blobber_id(&self) -> &str {
        &self.id
    }

    async fn upload_shard(
        &self,
        allocation_id: &str,
        req: UploadShardRequest,
    ) -> Result<UploadShardResult> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        self.simulate_latency().await;
        if self.fail_uploads.load(Ordering::Relaxed) {
            return Err(ShardVaultError::Network(format!(
                "{}: upload rejected",
                self.id
            )));
        }
        let expected = fragment_hash(&req.shard);
        if req.meta.hash != expected {
            return Err(ShardVaultError::IntegrityFailed(format!(
                "shard hash mismatch at chunk {}",
                req.meta.chunk_index
            )));
        }
        let mut state = self.state.lock();
        let conn = state.connections.entry(req.connection_id).or_default();
        let staged = conn.uploads.entry(req.meta.path.clone()).or_default();
        staged.filename = req.meta.filename;
        staged.mime_type = req.meta.mime_type;
        staged.encrypted_key = req.meta.encrypted_key;
        staged
            .fragments
            .insert(req.meta.chunk_index, req.shard.to_vec());
        staged
            .challenge_hashes
            .insert(req.meta.chunk_index, req.meta.challenge_hash);
        if let Some(thumbnail) = req.thumbnail_shard {
            staged.thumbnail = Some(thumbnail.to_vec());
            staged.thumbnail_hash = req.meta.thumbnail_hash;
        }
        if req.meta.is_final {
            staged.final_seen = true;
            staged.actual_size = req.meta.actual_size;
            staged.actual_hash = req.meta.actual_hash;
        }
        Ok(UploadShardResult {
            chunk_index: req.meta.chunk_index,
            hash: expected,
        })
    }

    async fn commit(
        &self,
        allocation_id: &str,
        connection_id: &str,
        write_marker: &WriteMarker,
    ) -> Result<CommitResult> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        write_marker.verify()?;
        let mut state = self.state.lock();
        if write_marker.prev_allocation_root != state.allocation_root {
            return Err(ShardVaultError::IntegrityFailed(format!(
                "stale previous root on {}",
                self.id
            )));
        }
        if write_marker.timestamp <= state.last_wm_timestamp {
            return Err(ShardVaultError::IntegrityFailed(format!(
                "write marker timestamp not increasing on {}",
                self.id
            )));
        }
        let mut conn = state
            .connections
            .remove(connection_id)
            .unwrap_or_default();
        // Uploads still waiting for their final chunk survive the commit and
        // stay staged on the connection.
        let mut incomplete = BTreeMap::new();
        let mut complete = BTreeMap::new();
        for (path, staged) in conn.uploads {
            if staged.final_seen {
                complete.insert(path, staged);
            } else {
                incomplete.insert(path, staged);
            }
        }
        conn.uploads = complete;
        Self::apply_connection(&mut state, allocation_id, conn);
        if !incomplete.is_empty() {
            state.connections.insert(
                connection_id.to_string(),
                Connection {
                    uploads: incomplete,
                    ops: Vec::new(),
                },
            );
        }
        state.allocation_root = write_marker.allocation_root.clone();
        state.last_wm_timestamp = write_marker.timestamp;
        state.commits += 1;
        if state.lock_holder.as_deref() == Some(connection_id) {
            state.lock_holder = None;
        }
        Ok(CommitResult {
            allocation_root: state.allocation_root.clone(),
        })
    }

    async fn download_shard(
        &self,
        allocation_id: &str,
        req: DownloadShardRequest,
    ) -> Result<DownloadShardResponse> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        self.simulate_latency().await;
        req.read_marker.verify()?;
        let mut state = self.state.lock();
        let counter = state
            .read_counters
            .entry(req.read_marker.client_id.clone())
            .or_insert(0);
        if req.read_marker.counter <= *counter {
            return Err(ShardVaultError::IntegrityFailed(format!(
                "read counter not increasing on {}",
                self.id
            )));
        }
        *counter = req.read_marker.counter;
        let file = state
            .files
            .values_mut()
            .find(|f| f.meta.lookup_hash == req.path_hash)
            .ok_or_else(|| {
                ShardVaultError::Network(format!("{}: file not found", self.id))
            })?;
        let mut fragments = match req.content_mode {
            ContentMode::Thumbnail => {
                vec![file.thumbnail.clone().ok_or_else(|| {
                    ShardVaultError::Network(format!("{}: no thumbnail", self.id))
                })?]
            }
            ContentMode::Full | ContentMode::Blocks => {
                let start = req.block_num as usize;
                let end = (start + req.num_blocks as usize).min(file.fragments.len());
                if start >= file.fragments.len() {
                    return Err(ShardVaultError::Network(format!(
                        "{}: block {} out of range",
                        self.id, start
                    )));
                }
                file.fragments[start..end].to_vec()
            }
        };
        file.num_block_downloads += fragments.len() as u64;
        if self.corrupt_downloads.load(Ordering::Relaxed) {
            for fragment in &mut fragments {
                if let Some(byte) = fragment.first_mut() {
                    *byte = byte.wrapping_add(1);
                }
            }
        }
        Ok(DownloadShardResponse { fragments })
    }

    async fn file_meta(&self, allocation_id: &str, lookup: &FileLookup) -> Result<Option<FileRef>> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        let state = self.state.lock();
        let found = match lookup {
            FileLookup::Path(path) => state
                .files
                .get(path)
                .map(|f| f.meta.clone())
                .or_else(|| state.dirs.get(path).cloned()),
            FileLookup::Hash(hash) => state
                .files
                .values()
                .map(|f| &f.meta)
                .chain(state.dirs.values())
                .find(|m| &m.lookup_hash == hash)
                .cloned(),
        };
        Ok(found)
    }

    async fn list_dir(&self, allocation_id: &str, path: &str) -> Result<ListResult> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        let state = self.state.lock();
        let mut children: Vec<FileRef> = state
            .files
            .values()
            .map(|f| &f.meta)
            .chain(state.dirs.values())
            .filter(|m| m.path != "/" && parent_dir(&m.path) == path && m.path != path)
            .cloned()
            .collect();
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(ListResult {
            path: path.to_string(),
            children,
        })
    }

    async fn file_stats(&self, allocation_id: &str, path: &str) -> Result<FileStats> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        let state = self.state.lock();
        let file = state.files.get(path).ok_or_else(|| {
            ShardVaultError::Network(format!("{}: file not found", self.id))
        })?;
        Ok(FileStats {
            path: path.to_string(),
            num_updates: file.num_updates,
            num_block_downloads: file.num_block_downloads,
            last_committed_at: file.meta.updated_at.clone(),
        })
    }

    async fn delete_file(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
    ) -> Result<()> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        let mut state = self.state.lock();
        if !state.files.contains_key(path) && !state.dirs.contains_key(path) {
            return Err(ShardVaultError::Network(format!(
                "{}: object not found",
                self.id
            )));
        }
        state
            .connections
            .entry(connection_id.to_string())
            .or_default()
            .ops
            .push(StagedOp::Delete {
                path: path.to_string(),
            });
        Ok(())
    }

    async fn rename_object(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        new_name: &str,
    ) -> Result<()> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        let mut state = self.state.lock();
        state
            .connections
            .entry(connection_id.to_string())
            .or_default()
            .ops
            .push(StagedOp::Rename {
                path: path.to_string(),
                new_name: new_name.to_string(),
            });
        Ok(())
    }

    async fn copy_object(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        dest_dir: &str,
    ) -> Result<()> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        let mut state = self.state.lock();
        state
            .connections
            .entry(connection_id.to_string())
            .or_default()
            .ops
            .push(StagedOp::Copy {
                path: path.to_string(),
                dest_dir: dest_dir.to_string(),
            });
        Ok(())
    }

    async fn move_object(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        dest_dir: &str,
    ) -> Result<()> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        let mut state = self.state.lock();
        state
            .connections
            .entry(connection_id.to_string())
            .or_default()
            .ops
            .push(StagedOp::Move {
                path: path.to_string(),
                dest_dir: dest_dir.to_string(),
            });
        Ok(())
    }

    async fn create_dir(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
    ) -> Result<()> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        let mut state = self.state.lock();
        state
            .connections
            .entry(connection_id.to_string())
            .or_default()
            .ops
            .push(StagedOp::Mkdir {
                path: path.to_string(),
            });
        Ok(())
    }

    async fn wm_lock(&self, allocation_id: &str, connection_id: &str) -> Result<WmLockResult> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        if self.deny_locks.load(Ordering::Relaxed) {
            return Ok(WmLockResult {
                status: WmLockStatus::Failed,
                created_at: Utc::now().timestamp(),
            });
        }
        if self
            .pending_locks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            })
            .is_ok()
        {
            return Ok(WmLockResult {
                status: WmLockStatus::Pending,
                created_at: Utc::now().timestamp(),
            });
        }
        let mut state = self.state.lock();
        match &state.lock_holder {
            Some(holder) if holder != connection_id => Ok(WmLockResult {
                status: WmLockStatus::Pending,
                created_at: Utc::now().timestamp(),
            }),
            _ => {
                state.lock_holder = Some(connection_id.to_string());
                Ok(WmLockResult {
                    status: WmLockStatus::Ok,
                    created_at: Utc::now().timestamp(),
                })
            }
        }
    }

    async fn wm_unlock(&self, allocation_id: &str, connection_id: &str) -> Result<()> {
        self.check_online()?;
        self.check_allocation(allocation_id)?;
        let mut state = self.state.lock();
        if state.lock_holder.as_deref() == Some(connection_id) {
            state.lock_holder = None;
        }
        Ok(())
    }
}
