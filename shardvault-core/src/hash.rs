//! Rolling hashers for uploads and downloads
//!
//! An upload maintains one rolling content hash over the raw byte stream (the
//! file-level hash recorded on commit), one rolling hash per shard position
//! (the shard roots), and derives a per-chunk challenge hash over the chunk's
//! fragments in index order.

use std::fmt;

/// Hex-encoded blake3 digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn verify(&self, data: &[u8]) -> bool {
        self == &Self::compute(data)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash of one on-wire fragment.
pub fn fragment_hash(fragment: &[u8]) -> String {
    blake3::hash(fragment).to_hex().to_string()
}

/// Challenge hash of a chunk: digest over its fragments in shard-index order.
pub fn challenge_hash(fragments: &[Vec<u8>]) -> String {
    let mut hasher = blake3::Hasher::new();
    for fragment in fragments {
        hasher.update(fragment);
    }
    hasher.finalize().to_hex().to_string()
}

/// Final hashes of a completed upload.
#[derive(Debug, Clone)]
pub struct FileHashes {
    /// File-level hash over the raw (pre-encode, pre-encrypt) bytes.
    pub content_hash: String,
    /// Rolling hash per shard position over that shard's fragments.
    pub shard_roots: Vec<String>,
}

/// Rolling hasher fed exactly once per chunk, in index order.
pub struct UploadHasher {
    file: blake3::Hasher,
    shards: Vec<blake3::Hasher>,
}

impl UploadHasher {
    pub fn new(total_shards: usize) -> Self {
        Self {
            file: blake3::Hasher::new(),
            shards: (0..total_shards).map(|_| blake3::Hasher::new()).collect(),
        }
    }

    /// Feed the raw bytes read from the source for one chunk.
    pub fn write_data(&mut self, raw: &[u8]) {
        self.file.update(raw);
    }

    /// Feed a chunk's fragments and return the chunk's challenge hash.
    pub fn write_fragments(&mut self, fragments: &[Vec<u8>]) -> String {
        for (hasher, fragment) in self.shards.iter_mut().zip(fragments.iter()) {
            hasher.update(fragment);
        }
        challenge_hash(fragments)
    }

    pub fn finalize(self) -> FileHashes {
        FileHashes {
            content_hash: self.file.finalize().to_hex().to_string(),
            shard_roots: self
                .shards
                .into_iter()
                .map(|h| h.finalize().to_hex().to_string())
                .collect(),
        }
    }
}
