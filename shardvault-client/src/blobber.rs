//! Blobber client
//!
//! `BlobberApi` is the typed surface of one storage provider; the engine
//! only ever talks to blobbers through it. `HttpBlobberClient` is the
//! production implementation over the blobber REST endpoints; the in-memory
//! implementation lives in `mock`.

use crate::marker::{ReadMarker, WriteMarker};
use crate::refs::{
    parse_json, CommitResult, FileRef, FileStats, ListResult, UploadShardResult, WmLockResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shardvault_core::{Result, ShardVaultError};
use std::time::Duration;

/// One storage provider of an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blobber {
    pub id: String,
    pub base_url: String,
}

/// Upload metadata sent alongside each shard, JSON-encoded into the
/// `uploadMeta` multipart field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMeta {
    pub filename: String,
    pub path: String,
    /// Hash of the shard bytes carried by this request.
    pub hash: String,
    pub challenge_hash: String,
    pub chunk_index: usize,
    pub is_final: bool,
    /// Logical file size (total bytes read so far on the final chunk).
    pub actual_size: u64,
    pub mime_type: String,
    /// Key fingerprint for sealed files, empty otherwise.
    #[serde(default)]
    pub encrypted_key: String,
    /// File-level content hash, present on the final chunk only.
    #[serde(default)]
    pub actual_hash: String,
    #[serde(default)]
    pub thumbnail_hash: String,
}

/// One shard upload against one blobber.
#[derive(Debug, Clone)]
pub struct UploadShardRequest {
    pub connection_id: String,
    pub meta: UploadMeta,
    pub shard: Bytes,
    /// Thumbnail fragment for this blobber, sent with chunk 0 only.
    pub thumbnail_shard: Option<Bytes>,
}

/// What a download request reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    Full,
    Thumbnail,
    /// A sub-range of the file body; `block_num`/`num_blocks` bound it.
    Blocks,
}

/// Identifies a remote file either by path or by lookup hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLookup {
    Path(String),
    Hash(String),
}

impl FileLookup {
    pub fn as_query(&self) -> (&'static str, &str) {
        match self {
            FileLookup::Path(p) => ("path", p),
            FileLookup::Hash(h) => ("path_hash", h),
        }
    }
}

/// One batch of block reads against one blobber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadShardRequest {
    pub read_marker: ReadMarker,
    pub path_hash: String,
    pub block_num: u64,
    pub num_blocks: u64,
    pub content_mode: ContentMode,
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Fragments returned by one blobber for one batch, in block order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadShardResponse {
    pub fragments: Vec<Vec<u8>>,
}

/// Typed operations against one blobber.
#[async_trait]
pub trait BlobberApi: Send + Sync {
    fn blobber_id(&self) -> &str;

    async fn upload_shard(
        &self,
        allocation_id: &str,
        req: UploadShardRequest,
    ) -> Result<UploadShardResult>;

    async fn commit(
        &self,
        allocation_id: &str,
        connection_id: &str,
        write_marker: &WriteMarker,
    ) -> Result<CommitResult>;

    async fn download_shard(
        &self,
        allocation_id: &str,
        req: DownloadShardRequest,
    ) -> Result<DownloadShardResponse>;

    /// `Ok(None)` when the blobber does not hold the file.
    async fn file_meta(&self, allocation_id: &str, lookup: &FileLookup) -> Result<Option<FileRef>>;

    async fn list_dir(&self, allocation_id: &str, path: &str) -> Result<ListResult>;

    async fn file_stats(&self, allocation_id: &str, path: &str) -> Result<FileStats>;

    async fn delete_file(&self, allocation_id: &str, connection_id: &str, path: &str)
        -> Result<()>;

    async fn rename_object(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        new_name: &str,
    ) -> Result<()>;

    async fn copy_object(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        dest_dir: &str,
    ) -> Result<()>;

    async fn move_object(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        dest_dir: &str,
    ) -> Result<()>;

    async fn create_dir(&self, allocation_id: &str, connection_id: &str, path: &str)
        -> Result<()>;

    async fn wm_lock(&self, allocation_id: &str, connection_id: &str) -> Result<WmLockResult>;

    async fn wm_unlock(&self, allocation_id: &str, connection_id: &str) -> Result<()>;
}

/// HTTP implementation of `BlobberApi` over the blobber REST surface.
pub struct HttpBlobberClient {
    blobber: Blobber,
    client: reqwest::Client,
}

impl HttpBlobberClient {
    pub fn new(blobber: Blobber, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ShardVaultError::Network(e.to_string()))?;
        Ok(Self { blobber, client })
    }

    fn url(&self, endpoint: &str, allocation_id: &str) -> String {
        format!(
            "{}/v1/{}/{}",
            self.blobber.base_url.trim_end_matches('/'),
            endpoint,
            allocation_id
        )
    }

    async fn read_body(response: reqwest::Response, what: &str) -> Result<Bytes> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ShardVaultError::Network(e.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else if status == StatusCode::NOT_FOUND {
            Err(ShardVaultError::Network(format!("{}: not found", what)))
        } else {
            Err(ShardVaultError::Network(format!(
                "{}: {} - {}",
                what,
                status.as_u16(),
                String::from_utf8_lossy(&body)
            )))
        }
    }

    async fn post_form(&self, url: String, form: &[(&str, String)], what: &str) -> Result<Bytes> {
        let response = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| ShardVaultError::Network(e.to_string()))?;
        Self::read_body(response, what).await
    }
}

#[async_trait]
impl BlobberApi for HttpBlobberClient {
    fn blobber_id(&self) -> &str {
        &self.blobber.id
    }

    async fn upload_shard(
        &self,
        allocation_id: &str,
        req: UploadShardRequest,
    ) -> Result<UploadShardResult> {
        let meta = serde_json::to_string(&req.meta)
            .map_err(|e| ShardVaultError::Corrupt(format!("upload meta: {}", e)))?;
        let mut form = reqwest::multipart::Form::new()
            .text("connection_id", req.connection_id.clone())
            .text("uploadMeta", meta)
            .part(
                "uploadFile",
                reqwest::multipart::Part::bytes(req.shard.to_vec())
                    .file_name(req.meta.filename.clone()),
            );
        if let Some(thumbnail) = req.thumbnail_shard {
            form = form.part(
                "uploadThumbnailFile",
                reqwest::multipart::Part::bytes(thumbnail.to_vec()),
            );
        }
        let response = self
            .client
            .post(self.url("file/upload", allocation_id))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ShardVaultError::Network(e.to_string()))?;
        let body = Self::read_body(response, "upload").await?;
        parse_json(&body, "upload result")
    }

    async fn commit(
        &self,
        allocation_id: &str,
        connection_id: &str,
        write_marker: &WriteMarker,
    ) -> Result<CommitResult> {
        let marker = serde_json::to_string(write_marker)
            .map_err(|e| ShardVaultError::Corrupt(format!("write marker: {}", e)))?;
        let body = self
            .post_form(
                self.url("connection/commit", allocation_id),
                &[
                    ("connection_id", connection_id.to_string()),
                    ("write_marker", marker),
                ],
                "commit",
            )
            .await?;
        parse_json(&body, "commit result")
    }

    async fn download_shard(
        &self,
        allocation_id: &str,
        req: DownloadShardRequest,
    ) -> Result<DownloadShardResponse> {
        let response = self
            .client
            .post(self.url("file/download", allocation_id))
            .json(&req)
            .send()
            .await
            .map_err(|e| ShardVaultError::Network(e.to_string()))?;
        let body = Self::read_body(response, "download").await?;
        parse_json(&body, "download response")
    }

    async fn file_meta(&self, allocation_id: &str, lookup: &FileLookup) -> Result<Option<FileRef>> {
        let (key, value) = lookup.as_query();
        let response = self
            .client
            .get(self.url("file/meta", allocation_id))
            .query(&[(key, value)])
            .send()
            .await
            .map_err(|e| ShardVaultError::Network(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::read_body(response, "file meta").await?;
        Ok(Some(parse_json(&body, "file ref")?))
    }

    async fn list_dir(&self, allocation_id: &str, path: &str) -> Result<ListResult> {
        let response = self
            .client
            .get(self.url("file/list", allocation_id))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| ShardVaultError::Network(e.to_string()))?;
        let body = Self::read_body(response, "list").await?;
        parse_json(&body, "list result")
    }

    async fn file_stats(&self, allocation_id: &str, path: &str) -> Result<FileStats> {
        let body = self
            .post_form(
                self.url("file/stats", allocation_id),
                &[("path", path.to_string())],
                "stats",
            )
            .await?;
        parse_json(&body, "file stats")
    }

    async fn delete_file(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
    ) -> Result<()> {
        let response = self
            .client
            .delete(self.url("file/delete", allocation_id))
            .query(&[("path", path), ("connection_id", connection_id)])
            .send()
            .await
            .map_err(|e| ShardVaultError::Network(e.to_string()))?;
        Self::read_body(response, "delete").await.map(|_| ())
    }

    async fn rename_object(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        new_name: &str,
    ) -> Result<()> {
        self.post_form(
            self.url("file/rename", allocation_id),
            &[
                ("connection_id", connection_id.to_string()),
                ("path", path.to_string()),
                ("new_name", new_name.to_string()),
            ],
            "rename",
        )
        .await
        .map(|_| ())
    }

    async fn copy_object(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        dest_dir: &str,
    ) -> Result<()> {
        self.post_form(
            self.url("file/copy", allocation_id),
            &[
                ("connection_id", connection_id.to_string()),
                ("path", path.to_string()),
                ("dest", dest_dir.to_string()),
            ],
            "copy",
        )
        .await
        .map(|_| ())
    }

    async fn move_object(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
        dest_dir: &str,
    ) -> Result<()> {
        self.post_form(
            self.url("file/move", allocation_id),
            &[
                ("connection_id", connection_id.to_string()),
                ("path", path.to_string()),
                ("dest", dest_dir.to_string()),
            ],
            "move",
        )
        .await
        .map(|_| ())
    }

    async fn create_dir(
        &self,
        allocation_id: &str,
        connection_id: &str,
        path: &str,
    ) -> Result<()> {
        self.post_form(
            self.url("dir", allocation_id),
            &[
                ("connection_id", connection_id.to_string()),
                ("path", path.to_string()),
            ],
            "create dir",
        )
        .await
        .map(|_| ())
    }

    async fn wm_lock(&self, allocation_id: &str, connection_id: &str) -> Result<WmLockResult> {
        let body = self
            .post_form(
                self.url("writemarker/lock", allocation_id),
                &[("connection_id", connection_id.to_string())],
                "wm lock",
            )
            .await?;
        parse_json(&body, "wm lock result")
    }

    async fn wm_unlock(&self, allocation_id: &str, connection_id: &str) -> Result<()> {
        self.post_form(
            self.url("writemarker/unlock", allocation_id),
            &[("connection_id", connection_id.to_string())],
            "wm unlock",
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let client = HttpBlobberClient::new(
            Blobber {
                id: "b0".into(),
                base_url: "http://blobber0.example.com/".into(),
            },
            Duration::from_secs(30),
        )
        .unwrap();
        assert_eq!(
            client.url("file/upload", "alloc1"),
            "http://blobber0.example.com/v1/file/upload/alloc1"
        );
    }

    #[test]
    fn test_lookup_query() {
        assert_eq!(
            FileLookup::Path("/a".into()).as_query(),
            ("path", "/a")
        );
        assert_eq!(
            FileLookup::Hash("abc".into()).as_query(),
            ("path_hash", "abc")
        );
    }

    #[test]
    fn test_upload_meta_json_shape() {
        let meta = UploadMeta {
            filename: "x".into(),
            path: "/x".into(),
            hash: "h".into(),
            challenge_hash: "c".into(),
            chunk_index: 3,
            is_final: false,
            actual_size: 10,
            mime_type: "text/plain".into(),
            encrypted_key: String::new(),
            actual_hash: String::new(),
            thumbnail_hash: String::new(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["chunk_index"], 3);
        assert_eq!(json["is_final"], false);
    }
}
