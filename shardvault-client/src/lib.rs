//! shardvault client engine
//!
//! Client-side engine of a shardvault deployment. An [`Allocation`] is the
//! entry point: it holds the blobber set, the signing identity, and a
//! dispatcher task that runs queued transfers. Uploads split the source
//! into chunks, erasure-code each chunk into one fragment per blobber, and
//! commit the batch with signed write markers under the write-marker
//! mutex; downloads reassemble any `data` of the fragments and verify the
//! recorded content hash on request.

pub mod allocation;
pub mod auth;
pub mod blobber;
pub mod callbacks;
pub mod config;
pub mod download;
pub mod marker;
pub mod mock;
pub mod progress;
pub mod refs;
pub mod registry;
pub mod upload;
pub mod wm_mutex;

pub use allocation::{Allocation, AllocationCore, AllocationParams};
pub use auth::AuthTicket;
pub use blobber::{Blobber, BlobberApi, ContentMode, FileLookup, HttpBlobberClient};
pub use callbacks::{AwaitableCallback, CompletedInfo, NoopCallback, OpKind, StatusCallback};
pub use config::EngineConfig;
pub use download::{ChunkedDownload, DownloadKind, DownloadRequest};
pub use marker::{ClientKeys, ReadMarker, WriteMarker};
pub use refs::{FileRef, FileStats, ListResult};
pub use registry::{
    AllocationRegistryStore, RegistryClient, RegistryStore, StarredFiles, STARRED_REGISTRY_PATH,
};
pub use upload::{ChunkedUpload, UploadRequest};
pub use wm_mutex::WriteMarkerMutex;
