//! Sync driver scenarios against in-memory blobbers.

use shardvault_client::mock::MockBlobber;
use shardvault_client::{
    Allocation, AllocationParams, AwaitableCallback, BlobberApi, ClientKeys, EngineConfig,
    UploadRequest,
};
use shardvault_sync::{SyncDriver, SyncOp};
use std::sync::Arc;

struct Harness {
    allocation: Arc<Allocation>,
    workdir: tempfile::TempDir,
}

fn harness() -> Harness {
    let workdir = tempfile::tempdir().unwrap();
    let blobbers = MockBlobber::cluster(3, "alloc");
    let allocation = Allocation::new(AllocationParams {
        id: "alloc".to_string(),
        data_shards: 2,
        parity_shards: 1,
        blobbers: blobbers
            .into_iter()
            .map(|b| b as Arc<dyn BlobberApi>)
            .collect(),
        keys: ClientKeys::generate(),
        owner_key: None,
        config: EngineConfig {
            chunk_size: 4096,
            progress_dir: workdir.path().join("progress"),
            ..EngineConfig::default()
        },
    })
    .unwrap();
    Harness {
        allocation,
        workdir,
    }
}

impl Harness {
    fn driver(&self) -> SyncDriver {
        SyncDriver::new(
            Arc::clone(&self.allocation),
            self.workdir.path().join("tree"),
            self.workdir.path().join("snapshot.json"),
        )
    }

    fn write_local(&self, rel: &str, content: &[u8]) {
        let path = self.workdir.path().join("tree").join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn read_local(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.workdir.path().join("tree").join(rel)).unwrap()
    }

    async fn upload_remote(&self, remote: &str, content: &[u8]) {
        let spool = self.workdir.path().join("spool.bin");
        std::fs::write(&spool, content).unwrap();
        let callback = AwaitableCallback::new();
        self.allocation
            .upload_file(
                UploadRequest {
                    local_path: spool,
                    remote_path: remote.to_string(),
                    mime_type: None,
                    encrypt: false,
                    is_update: false,
                    thumbnail_path: None,
                },
                callback.clone(),
            )
            .await
            .unwrap();
        callback.wait().await.unwrap();
    }

    async fn update_remote(&self, remote: &str, content: &[u8]) {
        let spool = self.workdir.path().join("spool.bin");
        std::fs::write(&spool, content).unwrap();
        let callback = AwaitableCallback::new();
        self.allocation
            .update_file(
                UploadRequest {
                    local_path: spool,
                    remote_path: remote.to_string(),
                    mime_type: None,
                    encrypt: false,
                    is_update: true,
                    thumbnail_path: None,
                },
                callback.clone(),
            )
            .await
            .unwrap();
        callback.wait().await.unwrap();
    }
}

#[tokio::test]
async fn test_first_sync_uploads_local_tree() {
    let h = harness();
    h.write_local("a.txt", b"alpha");
    h.write_local("docs/b.txt", b"beta");

    let report = h.driver().sync().await.unwrap();
    assert_eq!(report.applied.len(), 2);
    assert!(report.conflicts.is_empty() && report.failed.is_empty());
    assert!(h.allocation.file_meta("/a.txt").await.is_ok());
    assert!(h.allocation.file_meta("/docs/b.txt").await.is_ok());

    // Second run has nothing to do.
    let report = h.driver().sync().await.unwrap();
    assert!(report.applied.is_empty());
    h.allocation.shutdown().await;
}

#[tokio::test]
async fn test_local_edit_propagates_as_update() {
    let h = harness();
    h.write_local("a.txt", b"v1");
    h.driver().sync().await.unwrap();

    h.write_local("a.txt", b"v2 with more bytes");
    let plan = h.driver().plan().await.unwrap();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].op, SyncOp::Update);

    h.driver().sync().await.unwrap();
    let meta = h.allocation.file_meta("/a.txt").await.unwrap();
    assert_eq!(meta.actual_size, 18);
    h.allocation.shutdown().await;
}

#[tokio::test]
async fn test_remote_file_downloads() {
    let h = harness();
    h.upload_remote("/c.txt", b"from remote").await;

    let report = h.driver().sync().await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].op, SyncOp::Download);
    assert_eq!(h.read_local("c.txt"), b"from remote");
    h.allocation.shutdown().await;
}

#[tokio::test]
async fn test_local_deletion_deletes_remote() {
    let h = harness();
    h.write_local("a.txt", b"v1");
    h.driver().sync().await.unwrap();

    std::fs::remove_file(h.workdir.path().join("tree/a.txt")).unwrap();
    let report = h.driver().sync().await.unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].op, SyncOp::Delete);
    assert!(h.allocation.file_meta("/a.txt").await.is_err());
    h.allocation.shutdown().await;
}

#[tokio::test]
async fn test_local_dir_deletion_removes_remote_subtree() {
    let h = harness();
    h.write_local("docs/a.txt", b"alpha");
    h.write_local("docs/sub/b.txt", b"beta");
    h.write_local("keep.txt", b"kept");
    h.driver().sync().await.unwrap();

    std::fs::remove_dir_all(h.workdir.path().join("tree/docs")).unwrap();
    let report = h.driver().sync().await.unwrap();
    // One delete of the directory covers everything under it.
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].op, SyncOp::Delete);
    assert_eq!(report.applied[0].path, "/docs");
    assert!(h.allocation.file_meta("/docs").await.is_err());
    assert!(h.allocation.file_meta("/docs/a.txt").await.is_err());
    assert!(h.allocation.file_meta("/docs/sub/b.txt").await.is_err());
    assert!(h.allocation.file_meta("/keep.txt").await.is_ok());

    // The next run has nothing left to do.
    assert!(h.driver().plan().await.unwrap().is_empty());
    h.allocation.shutdown().await;
}

#[tokio::test]
async fn test_both_sides_changed_is_conflict() {
    let h = harness();
    h.write_local("a.txt", b"base");
    h.driver().sync().await.unwrap();

    h.write_local("a.txt", b"local edit");
    h.update_remote("/a.txt", b"remote edit").await;

    let report = h.driver().sync().await.unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(report.conflicts, vec!["/a.txt".to_string()]);
    // The conflicted file is untouched locally.
    assert_eq!(h.read_local("a.txt"), b"local edit");

    // Still flagged on the next run.
    let plan = h.driver().plan().await.unwrap();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].op, SyncOp::Conflict);
    h.allocation.shutdown().await;
}
