//! shardvault core library
//!
//! Leaf primitives of the shardvault client engine:
//! - Reed-Solomon fragment codec over `(data, parity)` stripes
//! - Rolling blake3 hashers (file content hash, shard roots, challenge hashes)
//! - Optional per-shard AES-256-GCM encryption
//! - The lazy chunk reader feeding the upload pipeline
//! - Consensus tracking and blobber masks

pub mod chunker;
pub mod consensus;
pub mod crypto;
pub mod erasure;
pub mod error;
pub mod hash;

pub use chunker::{effective_payload, encode_payload, Chunk, ChunkReader};
pub use consensus::{BlobberMask, Consensus, MAX_BLOBBERS};
pub use crypto::{ShardCipher, ShardKey, ENCRYPTION_HEADER_SIZE, ENCRYPTION_OVERHEAD, TAG_SIZE};
pub use erasure::FragmentCodec;
pub use error::{Result, ShardVaultError};
pub use hash::{challenge_hash, fragment_hash, ContentHash, FileHashes, UploadHasher};

/// Default per-upload chunk payload size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size the engine accepts (6 MiB, typical bulk upper bound).
pub const MAX_CHUNK_SIZE: usize = 6 * 1024 * 1024;
