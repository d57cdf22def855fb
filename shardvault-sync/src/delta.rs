//! Three-way delta
//!
//! Compares the local tree, the remote tree, and the snapshot taken after
//! the previous sync. The snapshot is what lets a one-sided change be told
//! apart from a deletion on the other side, and local modifications are
//! detected against the snapshot's local hash, never against remote state
//! (the two sides hash with different algorithms).

use crate::tree::{LocalEntry, RemoteEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to do about one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    /// New local file, push it.
    Upload,
    /// Local file changed, push it over the remote copy.
    Update,
    /// New or changed remote file, pull it.
    Download,
    /// Local file was deleted, delete the remote copy.
    Delete,
    /// Remote file was deleted, delete the local copy.
    LocalDelete,
    /// Both sides changed since the snapshot; needs the user.
    Conflict,
}

/// One planned action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItem {
    pub op: SyncOp,
    pub path: String,
    pub size: u64,
}

/// Per-path record of the state both sides agreed on at the last sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// SHA-1 of the local file at last sync.
    pub local_hash: String,
    /// Remote content hash at last sync.
    pub remote_hash: String,
    pub size: u64,
}

pub type Snapshot = BTreeMap<String, SnapshotEntry>;

/// Compute the sync plan. Paths with an excluded prefix are dropped, and
/// descendants of a deleted directory fold into its delete.
pub fn compute_delta(
    local: &BTreeMap<String, LocalEntry>,
    remote: &BTreeMap<String, RemoteEntry>,
    snapshot: &Snapshot,
    exclude: &[String],
) -> Vec<SyncItem> {
    let mut items = Vec::new();

    for (path, local_entry) in local {
        if is_excluded(path, exclude) {
            continue;
        }
        match (remote.get(path), snapshot.get(path)) {
            (Some(remote_entry), _) if local_entry.is_dir != remote_entry.is_dir => {
                // A file on one side, a directory on the other.
                items.push(SyncItem {
                    op: SyncOp::Conflict,
                    path: path.clone(),
                    size: local_entry.size,
                });
            }
            (Some(_), _) if local_entry.is_dir => {
                // Matched directories carry no content of their own.
            }
            (Some(remote_entry), Some(snap)) => {
                let local_changed = local_entry.hash != snap.local_hash;
                let remote_changed = remote_entry.content_hash != snap.remote_hash;
                let op = match (local_changed, remote_changed) {
                    (true, true) => Some(SyncOp::Conflict),
                    (true, false) => Some(SyncOp::Update),
                    (false, true) => Some(SyncOp::Download),
                    (false, false) => None,
                };
                if let Some(op) = op {
                    let size = match op {
                        SyncOp::Download => remote_entry.size,
                        _ => local_entry.size,
                    };
                    items.push(SyncItem {
                        op,
                        path: path.clone(),
                        size,
                    });
                }
            }
            (Some(remote_entry), None) => {
                // Both sides have the file but it was never synced. The
                // hashes are not comparable, so sizes are the only signal.
                if local_entry.size != remote_entry.size {
                    items.push(SyncItem {
                        op: SyncOp::Conflict,
                        path: path.clone(),
                        size: local_entry.size,
                    });
                }
            }
            (None, Some(_)) => items.push(SyncItem {
                op: SyncOp::LocalDelete,
                path: path.clone(),
                size: local_entry.size,
            }),
            (None, None) => {
                // New local directories materialize remotely when the files
                // under them upload.
                if !local_entry.is_dir {
                    items.push(SyncItem {
                        op: SyncOp::Upload,
                        path: path.clone(),
                        size: local_entry.size,
                    });
                }
            }
        }
    }

    for (path, remote_entry) in remote {
        if is_excluded(path, exclude) || local.contains_key(path) {
            continue;
        }
        if snapshot.contains_key(path) {
            items.push(SyncItem {
                op: SyncOp::Delete,
                path: path.clone(),
                size: remote_entry.size,
            });
        } else if !remote_entry.is_dir {
            // New remote directories materialize locally when the files
            // under them download.
            items.push(SyncItem {
                op: SyncOp::Download,
                path: path.clone(),
                size: remote_entry.size,
            });
        }
    }

    items.sort_by(|a, b| a.path.cmp(&b.path));
    prune_deleted_subtrees(items)
}

/// Drop every item under a deleted path; the delete of the directory itself
/// covers them. Relies on the path-sorted order keeping descendants
/// adjacent to their ancestor.
fn prune_deleted_subtrees(items: Vec<SyncItem>) -> Vec<SyncItem> {
    let mut kept: Vec<SyncItem> = Vec::with_capacity(items.len());
    let mut deleted_prefix: Option<String> = None;
    for item in items {
        if deleted_prefix
            .as_deref()
            .is_some_and(|prefix| item.path.starts_with(prefix))
        {
            continue;
        }
        if matches!(item.op, SyncOp::Delete | SyncOp::LocalDelete) {
            deleted_prefix = Some(format!("{}/", item.path));
        }
        kept.push(item);
    }
    kept
}

fn is_excluded(path: &str, exclude: &[String]) -> bool {
    exclude.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(path: &str, hash: &str, size: u64) -> (String, LocalEntry) {
        (
            path.to_string(),
            LocalEntry {
                path: path.to_string(),
                size,
                hash: hash.to_string(),
                is_dir: false,
            },
        )
    }

    fn local_dir(path: &str) -> (String, LocalEntry) {
        (
            path.to_string(),
            LocalEntry {
                path: path.to_string(),
                size: 0,
                hash: String::new(),
                is_dir: true,
            },
        )
    }

    fn remote(path: &str, hash: &str, size: u64) -> (String, RemoteEntry) {
        (
            path.to_string(),
            RemoteEntry {
                path: path.to_string(),
                size,
                content_hash: hash.to_string(),
                is_dir: false,
            },
        )
    }

    fn remote_dir(path: &str) -> (String, RemoteEntry) {
        (
            path.to_string(),
            RemoteEntry {
                path: path.to_string(),
                size: 0,
                content_hash: String::new(),
                is_dir: true,
            },
        )
    }

    fn snap(path: &str, local_hash: &str, remote_hash: &str) -> (String, SnapshotEntry) {
        (
            path.to_string(),
            SnapshotEntry {
                local_hash: local_hash.to_string(),
                remote_hash: remote_hash.to_string(),
                size: 1,
            },
        )
    }

    fn ops(items: &[SyncItem]) -> Vec<(SyncOp, &str)> {
        items.iter().map(|i| (i.op, i.path.as_str())).collect()
    }

    #[test]
    fn test_new_local_file_uploads() {
        let local = BTreeMap::from([local("/a", "l1", 5)]);
        let items = compute_delta(&local, &BTreeMap::new(), &Snapshot::new(), &[]);
        assert_eq!(ops(&items), vec![(SyncOp::Upload, "/a")]);
    }

    #[test]
    fn test_new_remote_file_downloads() {
        let remote = BTreeMap::from([remote("/a", "r1", 5)]);
        let items = compute_delta(&BTreeMap::new(), &remote, &Snapshot::new(), &[]);
        assert_eq!(ops(&items), vec![(SyncOp::Download, "/a")]);
    }

    #[test]
    fn test_local_edit_updates() {
        let local = BTreeMap::from([local("/a", "l2", 5)]);
        let remote = BTreeMap::from([remote("/a", "r1", 5)]);
        let snapshot = Snapshot::from([snap("/a", "l1", "r1")]);
        let items = compute_delta(&local, &remote, &snapshot, &[]);
        assert_eq!(ops(&items), vec![(SyncOp::Update, "/a")]);
    }

    #[test]
    fn test_remote_edit_downloads() {
        let local = BTreeMap::from([local("/a", "l1", 5)]);
        let remote = BTreeMap::from([remote("/a", "r2", 6)]);
        let snapshot = Snapshot::from([snap("/a", "l1", "r1")]);
        let items = compute_delta(&local, &remote, &snapshot, &[]);
        assert_eq!(ops(&items), vec![(SyncOp::Download, "/a")]);
        assert_eq!(items[0].size, 6);
    }

    #[test]
    fn test_both_edited_conflicts() {
        let local = BTreeMap::from([local("/a", "l2", 5)]);
        let remote = BTreeMap::from([remote("/a", "r2", 5)]);
        let snapshot = Snapshot::from([snap("/a", "l1", "r1")]);
        let items = compute_delta(&local, &remote, &snapshot, &[]);
        assert_eq!(ops(&items), vec![(SyncOp::Conflict, "/a")]);
    }

    #[test]
    fn test_unchanged_is_skipped() {
        let local = BTreeMap::from([local("/a", "l1", 5)]);
        let remote = BTreeMap::from([remote("/a", "r1", 5)]);
        let snapshot = Snapshot::from([snap("/a", "l1", "r1")]);
        assert!(compute_delta(&local, &remote, &snapshot, &[]).is_empty());
    }

    #[test]
    fn test_local_deletion_deletes_remote() {
        let remote = BTreeMap::from([remote("/a", "r1", 5)]);
        let snapshot = Snapshot::from([snap("/a", "l1", "r1")]);
        let items = compute_delta(&BTreeMap::new(), &remote, &snapshot, &[]);
        assert_eq!(ops(&items), vec![(SyncOp::Delete, "/a")]);
    }

    #[test]
    fn test_remote_deletion_deletes_local() {
        let local = BTreeMap::from([local("/a", "l1", 5)]);
        let snapshot = Snapshot::from([snap("/a", "l1", "r1")]);
        let items = compute_delta(&local, &BTreeMap::new(), &snapshot, &[]);
        assert_eq!(ops(&items), vec![(SyncOp::LocalDelete, "/a")]);
    }

    #[test]
    fn test_never_synced_same_size_is_left_alone() {
        let local = BTreeMap::from([local("/a", "l1", 5)]);
        let remote = BTreeMap::from([remote("/a", "r1", 5)]);
        let items = compute_delta(&local, &remote, &Snapshot::new(), &[]);
        assert!(items.is_empty());
    }

    #[test]
    fn test_never_synced_size_mismatch_conflicts() {
        let local = BTreeMap::from([local("/a", "l1", 5)]);
        let remote = BTreeMap::from([remote("/a", "r1", 9)]);
        let items = compute_delta(&local, &remote, &Snapshot::new(), &[]);
        assert_eq!(ops(&items), vec![(SyncOp::Conflict, "/a")]);
    }

    #[test]
    fn test_exclusions_prune_both_sides() {
        let local = BTreeMap::from([local("/tmp/a", "l1", 5)]);
        let remote = BTreeMap::from([remote("/tmp/b", "r1", 5)]);
        let items = compute_delta(&local, &remote, &Snapshot::new(), &["/tmp/".to_string()]);
        assert!(items.is_empty());
    }

    #[test]
    fn test_matched_directories_are_skipped() {
        let local = BTreeMap::from([local_dir("/docs"), local("/docs/a", "l1", 5)]);
        let remote = BTreeMap::from([remote_dir("/docs"), remote("/docs/a", "r1", 5)]);
        let snapshot = Snapshot::from([snap("/docs/a", "l1", "r1")]);
        assert!(compute_delta(&local, &remote, &snapshot, &[]).is_empty());
    }

    #[test]
    fn test_new_directories_carry_no_op_of_their_own() {
        let local = BTreeMap::from([local_dir("/up"), local("/up/a", "l1", 5)]);
        let remote = BTreeMap::from([remote_dir("/down"), remote("/down/b", "r1", 5)]);
        let items = compute_delta(&local, &remote, &Snapshot::new(), &[]);
        assert_eq!(
            ops(&items),
            vec![(SyncOp::Download, "/down/b"), (SyncOp::Upload, "/up/a")]
        );
    }

    #[test]
    fn test_file_directory_type_mismatch_conflicts() {
        let local = BTreeMap::from([local("/x", "l1", 5)]);
        let remote = BTreeMap::from([remote_dir("/x")]);
        let items = compute_delta(&local, &remote, &Snapshot::new(), &[]);
        assert_eq!(ops(&items), vec![(SyncOp::Conflict, "/x")]);
    }

    #[test]
    fn test_remote_delete_prunes_descendants() {
        // The whole local subtree is gone; one remote delete covers it.
        let remote = BTreeMap::from([
            remote_dir("/d"),
            remote("/d/a", "r1", 5),
            remote("/d/sub/b", "r2", 5),
            remote("/e", "r3", 5),
        ]);
        let snapshot = Snapshot::from([
            snap("/d", "", ""),
            snap("/d/a", "l1", "r1"),
            snap("/d/sub/b", "l2", "r2"),
            snap("/e", "l3", "r3"),
        ]);
        let items = compute_delta(&BTreeMap::new(), &remote, &snapshot, &[]);
        assert_eq!(
            ops(&items),
            vec![(SyncOp::Delete, "/d"), (SyncOp::Delete, "/e")]
        );
    }

    #[test]
    fn test_local_delete_prunes_descendants() {
        let local = BTreeMap::from([
            local_dir("/d"),
            local("/d/a", "l1", 5),
            local("/d2", "l2", 5),
        ]);
        let snapshot = Snapshot::from([
            snap("/d", "", ""),
            snap("/d/a", "l1", "r1"),
            snap("/d2", "l2", "r2"),
        ]);
        let items = compute_delta(&local, &BTreeMap::new(), &snapshot, &[]);
        // "/d2" shares the "/d" prefix but is not a descendant.
        assert_eq!(
            ops(&items),
            vec![(SyncOp::LocalDelete, "/d"), (SyncOp::LocalDelete, "/d2")]
        );
    }

    #[test]
    fn test_plan_is_sorted_by_path() {
        let local = BTreeMap::from([local("/z", "l1", 1), local("/a", "l1", 1)]);
        let items = compute_delta(&local, &BTreeMap::new(), &Snapshot::new(), &[]);
        assert_eq!(ops(&items), vec![(SyncOp::Upload, "/a"), (SyncOp::Upload, "/z")]);
    }
}
