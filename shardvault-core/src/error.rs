//! Error types for shardvault
//!
//! Provides a unified error type shared across the engine crates.

use thiserror::Error;

/// Result type alias for shardvault operations
pub type Result<T> = std::result::Result<T, ShardVaultError>;

/// Unified error type for shardvault
#[derive(Error, Debug)]
pub enum ShardVaultError {
    // ===== Engine Lifecycle Errors =====
    #[error("Allocation engine is not initialized")]
    NotInitialized,

    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    #[error("Not enough blobbers: have {have}, need {need}")]
    NoBlobbers { have: usize, need: usize },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // ===== Codec Errors =====
    #[error("Erasure codec error: {0}")]
    Codec(String),

    #[error("Insufficient fragments: have {available}, need {required}")]
    InsufficientFragments { available: usize, required: usize },

    #[error("Fragment size mismatch: expected {expected}, got {actual}")]
    FragmentSizeMismatch { expected: usize, actual: usize },

    // ===== Cryptography Errors =====
    #[error("Encryption error: {0}")]
    Encrypt(String),

    #[error("Decryption error: {0}")]
    Decrypt(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    // ===== Consensus Errors =====
    #[error("Consensus failed: {successes} of {full} blobbers succeeded, threshold {threshold}")]
    ConsensusFailed {
        successes: usize,
        threshold: usize,
        full: usize,
    },

    #[error("File metadata consensus not reached")]
    MetadataConsensus,

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    ContentHashMismatch { expected: String, actual: String },

    #[error("Integrity check failed: {0}")]
    IntegrityFailed(String),

    // ===== Write-Marker Mutex Errors =====
    #[error("Write marker lock denied: {granted} of {threshold} grants")]
    LockDenied { granted: usize, threshold: usize },

    #[error("Write marker lock timed out")]
    LockTimeout,

    #[error("Partial write marker lock: {granted} of {threshold} grants, released")]
    PartialLock { granted: usize, threshold: usize },

    // ===== Auth Errors =====
    #[error("Auth ticket error: {0}")]
    AuthTicket(String),

    // ===== Transport / I/O Errors =====
    #[error("Network error: {0}")]
    Network(String),

    #[error("Local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<reed_solomon_erasure::Error> for ShardVaultError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        ShardVaultError::Codec(err.to_string())
    }
}
