//! Tree walkers
//!
//! Builds flat path-keyed views of the two sides of a sync: the remote
//! allocation tree (breadth-first over directory listings) and the local
//! directory (recursive walk, hashing file contents with SHA-1).

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use shardvault_client::{Allocation, ListResult};
use shardvault_core::Result;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Read;
use std::path::Path;

/// Directory listing source for the remote side.
#[async_trait]
pub trait RemoteLister: Send + Sync {
    async fn list_dir(&self, path: &str) -> Result<ListResult>;
}

#[async_trait]
impl RemoteLister for Allocation {
    async fn list_dir(&self, path: &str) -> Result<ListResult> {
        Allocation::list_dir(self, path).await
    }
}

/// One remote file or directory as the sync driver sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub size: u64,
    /// Empty for directories.
    pub content_hash: String,
    pub is_dir: bool,
}

/// One local file or directory as the sync driver sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: String,
    pub size: u64,
    /// SHA-1 of the file contents, hex encoded. Empty for directories.
    pub hash: String,
    pub is_dir: bool,
}

/// Walk the allocation tree breadth-first, returning files and directories
/// keyed by remote path. The root itself is not returned.
pub async fn remote_tree(
    lister: &dyn RemoteLister,
    root: &str,
) -> Result<BTreeMap<String, RemoteEntry>> {
    let mut entries = BTreeMap::new();
    let mut queue = VecDeque::from([root.to_string()]);
    while let Some(dir) = queue.pop_front() {
        let listing = lister.list_dir(&dir).await?;
        for child in listing.children {
            if child.is_dir() {
                entries.insert(
                    child.path.clone(),
                    RemoteEntry {
                        path: child.path.clone(),
                        size: 0,
                        content_hash: String::new(),
                        is_dir: true,
                    },
                );
                queue.push_back(child.path);
            } else {
                entries.insert(
                    child.path.clone(),
                    RemoteEntry {
                        path: child.path,
                        size: child.actual_size,
                        content_hash: child.content_hash,
                        is_dir: false,
                    },
                );
            }
        }
    }
    Ok(entries)
}

/// Walk a local directory, returning files and directories keyed by their
/// remote-style path relative to `root` (forward slashes, leading `/`).
pub fn local_tree(root: &Path) -> Result<BTreeMap<String, LocalEntry>> {
    let mut entries = BTreeMap::new();
    walk(root, "", &mut entries)?;
    Ok(entries)
}

fn walk(dir: &Path, prefix: &str, entries: &mut BTreeMap<String, LocalEntry>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let remote_path = format!("{}/{}", prefix, name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            entries.insert(
                remote_path.clone(),
                LocalEntry {
                    path: remote_path.clone(),
                    size: 0,
                    hash: String::new(),
                    is_dir: true,
                },
            );
            walk(&entry.path(), &remote_path, entries)?;
        } else if file_type.is_file() {
            let metadata = entry.metadata()?;
            entries.insert(
                remote_path.clone(),
                LocalEntry {
                    path: remote_path,
                    size: metadata.len(),
                    hash: sha1_file(&entry.path())?,
                    is_dir: false,
                },
            );
        }
        // Symlinks and other special files are skipped.
    }
    Ok(())
}

/// SHA-1 of a file's contents, streamed.
pub fn sha1_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
