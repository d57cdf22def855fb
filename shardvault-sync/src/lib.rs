//! shardvault sync driver
//!
//! Keeps a local directory and an allocation tree in step. Each run builds
//! both trees, diffs them against the snapshot saved by the previous run,
//! executes the resulting plan through the allocation's pipelines, and
//! atomically replaces the snapshot. Conflicts are reported, never
//! auto-resolved.

pub mod delta;
pub mod tree;

pub use delta::{compute_delta, Snapshot, SnapshotEntry, SyncItem, SyncOp};
pub use tree::{local_tree, remote_tree, sha1_file, LocalEntry, RemoteEntry, RemoteLister};

use shardvault_client::{Allocation, AwaitableCallback, DownloadRequest, UploadRequest};
use shardvault_core::{Result, ShardVaultError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one sync run.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub applied: Vec<SyncItem>,
    pub conflicts: Vec<String>,
    /// Path and display form of the failure.
    pub failed: Vec<(String, String)>,
}

/// Driver tying one local directory to one allocation.
pub struct SyncDriver {
    allocation: Arc<Allocation>,
    local_root: PathBuf,
    snapshot_path: PathBuf,
    exclude: Vec<String>,
}

impl SyncDriver {
    pub fn new(
        allocation: Arc<Allocation>,
        local_root: impl Into<PathBuf>,
        snapshot_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            allocation,
            local_root: local_root.into(),
            snapshot_path: snapshot_path.into(),
            // Registry documents never sync to disk.
            exclude: vec!["/.registry/".to_string()],
        }
    }

    /// Add remote-path prefixes to skip on both sides.
    pub fn exclude(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.exclude.extend(prefixes);
        self
    }

    /// Build the plan without executing it.
    pub async fn plan(&self) -> Result<Vec<SyncItem>> {
        let snapshot = self.load_snapshot();
        fs::create_dir_all(&self.local_root)?;
        let local = local_tree(&self.local_root)?;
        let remote = remote_tree(&*self.allocation, "/").await?;
        Ok(compute_delta(&local, &remote, &snapshot, &self.exclude))
    }

    /// Execute the plan, then persist a fresh snapshot of everything that is
    /// now in step on both sides.
    pub async fn sync(&self) -> Result<SyncReport> {
        let items = self.plan().await?;
        let mut report = SyncReport::default();

        for item in items {
            let outcome = match item.op {
                SyncOp::Conflict => {
                    warn!(path = %item.path, "conflict, skipping");
                    report.conflicts.push(item.path.clone());
                    continue;
                }
                SyncOp::Upload => self.push(&item.path, false).await,
                SyncOp::Update => self.push(&item.path, true).await,
                SyncOp::Download => self.pull(&item.path).await,
                SyncOp::Delete => self.allocation.delete_file(&item.path).await,
                SyncOp::LocalDelete => self.remove_local(&item.path),
            };
            match outcome {
                Ok(()) => report.applied.push(item),
                Err(e) => {
                    warn!(path = %item.path, error = %e, "sync step failed");
                    report.failed.push((item.path, e.to_string()));
                }
            }
        }

        self.save_snapshot(&report).await?;
        info!(
            applied = report.applied.len(),
            conflicts = report.conflicts.len(),
            failed = report.failed.len(),
            "sync run finished"
        );
        Ok(report)
    }

    fn local_path(&self, remote_path: &str) -> PathBuf {
        self.local_root.join(remote_path.trim_start_matches('/'))
    }

    fn remove_local(&self, remote_path: &str) -> Result<()> {
        let path = self.local_path(remote_path);
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn push(&self, remote_path: &str, is_update: bool) -> Result<()> {
        let request = UploadRequest {
            local_path: self.local_path(remote_path),
            remote_path: remote_path.to_string(),
            mime_type: None,
            encrypt: false,
            is_update,
            thumbnail_path: None,
        };
        let callback = AwaitableCallback::new();
        if is_update {
            self.allocation.update_file(request, callback.clone()).await?;
        } else {
            self.allocation.upload_file(request, callback.clone()).await?;
        }
        callback
            .wait()
            .await
            .map(|_| ())
            .map_err(|e| ShardVaultError::Corrupt(format!("push {}: {}", remote_path, e)))
    }

    async fn pull(&self, remote_path: &str) -> Result<()> {
        let local_path = self.local_path(remote_path);
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut request = DownloadRequest::new(remote_path, local_path);
        request.verify = true;
        let callback = AwaitableCallback::new();
        self.allocation.download_file(request, callback.clone()).await?;
        callback
            .wait()
            .await
            .map(|_| ())
            .map_err(|e| ShardVaultError::Corrupt(format!("pull {}: {}", remote_path, e)))
    }

    fn load_snapshot(&self) -> Snapshot {
        match fs::read(&self.snapshot_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "unreadable snapshot, treating as first sync");
                Snapshot::new()
            }),
            Err(_) => Snapshot::new(),
        }
    }

    /// Rebuild the snapshot from the post-sync trees. Paths still in
    /// conflict or failed are left out so the next run sees them again.
    async fn save_snapshot(&self, report: &SyncReport) -> Result<()> {
        let local = local_tree(&self.local_root)?;
        let remote = remote_tree(&*self.allocation, "/").await?;
        let mut snapshot = Snapshot::new();
        for (path, local_entry) in &local {
            if report.conflicts.iter().any(|p| p == path)
                || report.failed.iter().any(|(p, _)| p == path)
            {
                continue;
            }
            if let Some(remote_entry) = remote.get(path) {
                snapshot.insert(
                    path.clone(),
                    SnapshotEntry {
                        local_hash: local_entry.hash.clone(),
                        remote_hash: remote_entry.content_hash.clone(),
                        size: local_entry.size,
                    },
                );
            }
        }
        write_snapshot(&self.snapshot_path, &snapshot)
    }
}

/// Atomically replace the snapshot file.
fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| ShardVaultError::Corrupt(format!("snapshot: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_write_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/snapshot.json");
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "/a".to_string(),
            SnapshotEntry {
                local_hash: "l".into(),
                remote_hash: "r".into(),
                size: 3,
            },
        );
        write_snapshot(&path, &snapshot).unwrap();
        write_snapshot(&path, &Snapshot::new()).unwrap();
        let loaded: Snapshot = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert!(loaded.is_empty());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
