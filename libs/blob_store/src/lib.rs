//! A uniform blob API over the object stores pgvault keeps backups in.
//!
//! The storage drivers differ wildly in how they report failures, so this
//! crate deliberately keeps classification coarse: a small set of variants
//! the agent can act on (`NotFound`, `Timeout`, `Cancelled`) and an `Other`
//! variant that wraps the driver error without truncating its cause chain.
//! Operator logs need the low-level error text verbatim; higher layers
//! decide what is retryable.

mod local_fs;
mod s3_bucket;

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub use local_fs::LocalFs;
pub use s3_bucket::S3Bucket;

pub const PREFIX_SEPARATOR: char = '/';

/// Default timeout for a single storage operation. Downloads of large blobs
/// hold the stream open longer; the timeout covers request initiation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_S3_CONCURRENCY_LIMIT: usize = 100;

/// Path relative to the store's configured root (bucket prefix or local
/// directory). Never absolute, always `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePath(Utf8PathBuf);

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RemotePath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "Path {relative_path:?} is not relative"
        );
        Ok(Self(relative_path.to_path_buf()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    pub fn join(&self, segment: impl AsRef<Utf8Path>) -> Self {
        Self(self.0.join(segment))
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }

    /// The last path segment, i.e. the blob's own name without its prefix.
    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn strip_prefix(&self, p: &RemotePath) -> Result<&Utf8Path, std::path::StripPrefixError> {
        self.0.strip_prefix(&p.0)
    }
}

/// Extra set of key-value pairs stored with each blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata(pub HashMap<String, String>);

impl StorageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for StorageMetadata {
    fn from(arr: [(&str, &str); N]) -> Self {
        let map = arr
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self(map)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("No blob found for the given path")]
    NotFound,
    #[error("Timed out during the storage operation")]
    Timeout,
    #[error("The storage operation was cancelled")]
    Cancelled,
    /// The driver error, cause chain intact.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Errors which retrying cannot fix. Everything else (timeouts,
    /// throttling, transport hiccups inside `Other`) is worth another
    /// attempt with backoff.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StorageError::NotFound | StorageError::Cancelled)
    }
}

pub type BlobStream = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// Result of a get operation: the blob byte stream plus its stored metadata.
pub struct Download {
    pub download_stream: BlobStream,
    pub size: Option<u64>,
    pub metadata: StorageMetadata,
}

impl Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("size", &self.size)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub key: RemotePath,
    pub size: u64,
    pub metadata: StorageMetadata,
}

/// Callback invoked with the running byte count as a download progresses.
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(u64) + Send);

/// The uniform interface every storage backend implements.
///
/// All operations may fail with [`StorageError`]; none of them wraps the
/// driver error in a way that loses the underlying cause.
#[async_trait]
pub trait BlobStorage: Send + Sync + 'static {
    /// Streams `from` into the blob at `to`, attaching `metadata` to it.
    /// `size` must be the exact byte length of the stream.
    async fn put(
        &self,
        to: &RemotePath,
        from: BlobStream,
        size: usize,
        metadata: &StorageMetadata,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;

    async fn get(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Download, StorageError>;

    /// Lists blobs under `prefix`: direct children only, or the whole
    /// subtree with `deep`. Entries come back sorted by key and carry the
    /// per-blob metadata.
    async fn list(
        &self,
        prefix: &RemotePath,
        deep: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<ListEntry>, StorageError>;

    async fn delete(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;

    async fn get_metadata(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<StorageMetadata, StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket_name: String,
    pub bucket_region: String,
    pub prefix_in_bucket: Option<String>,
    /// Custom endpoint for S3-compatible stores (minio, ceph-rgw).
    pub endpoint: Option<String>,
    #[serde(default = "default_s3_concurrency")]
    pub concurrency_limit: NonZeroUsize,
    pub max_keys_per_list_response: Option<i32>,
}

fn default_s3_concurrency() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_S3_CONCURRENCY_LIMIT).expect("constant is non-zero")
}

/// External configuration of a site's blob store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BlobStorageConfig {
    LocalFs { local_path: Utf8PathBuf },
    AwsS3(S3Config),
}

/// Static dispatch over the configured backends, mirroring the trait and
/// adding the byte-level conveniences callers actually want.
#[derive(Clone)]
pub enum GenericBlobStorage {
    LocalFs(LocalFs),
    AwsS3(Arc<S3Bucket>),
}

impl GenericBlobStorage {
    pub fn from_config(config: &BlobStorageConfig) -> anyhow::Result<Self> {
        match config {
            BlobStorageConfig::LocalFs { local_path } => {
                tracing::info!("Using fs root '{local_path}' as a blob storage");
                Ok(Self::LocalFs(LocalFs::new(local_path.clone())?))
            }
            BlobStorageConfig::AwsS3(s3_config) => {
                tracing::info!(
                    "Using s3 bucket '{}' in region '{}' as a blob storage, prefix in bucket: '{:?}'",
                    s3_config.bucket_name,
                    s3_config.bucket_region,
                    s3_config.prefix_in_bucket
                );
                Ok(Self::AwsS3(Arc::new(S3Bucket::new(
                    s3_config,
                    DEFAULT_TIMEOUT,
                )?)))
            }
        }
    }

    pub async fn put(
        &self,
        to: &RemotePath,
        from: BlobStream,
        size: usize,
        metadata: &StorageMetadata,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        match self {
            Self::LocalFs(s) => s.put(to, from, size, metadata, cancel).await,
            Self::AwsS3(s) => s.put(to, from, size, metadata, cancel).await,
        }
    }

    pub async fn get(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Download, StorageError> {
        match self {
            Self::LocalFs(s) => s.get(from, cancel).await,
            Self::AwsS3(s) => s.get(from, cancel).await,
        }
    }

    pub async fn list(
        &self,
        prefix: &RemotePath,
        deep: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<ListEntry>, StorageError> {
        match self {
            Self::LocalFs(s) => s.list(prefix, deep, cancel).await,
            Self::AwsS3(s) => s.list(prefix, deep, cancel).await,
        }
    }

    pub async fn delete(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        match self {
            Self::LocalFs(s) => s.delete(path, cancel).await,
            Self::AwsS3(s) => s.delete(path, cancel).await,
        }
    }

    pub async fn get_metadata(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<StorageMetadata, StorageError> {
        match self {
            Self::LocalFs(s) => s.get_metadata(path, cancel).await,
            Self::AwsS3(s) => s.get_metadata(path, cancel).await,
        }
    }

    /// Stores a blob already materialized in memory.
    pub async fn put_bytes(
        &self,
        to: &RemotePath,
        data: Bytes,
        metadata: &StorageMetadata,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let size = data.len();
        let stream: BlobStream = Box::pin(std::io::Cursor::new(data));
        self.put(to, stream, size, metadata, cancel).await
    }

    /// Stores a zero-length marker blob carrying only metadata.
    pub async fn put_empty(
        &self,
        to: &RemotePath,
        metadata: &StorageMetadata,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        self.put_bytes(to, Bytes::new(), metadata, cancel).await
    }

    /// Fetches a whole blob into memory. Only for blobs known to be small,
    /// e.g. backup manifests.
    pub async fn get_bytes(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, StorageMetadata), StorageError> {
        let mut download = self.get(from, cancel).await?;
        let mut buf = Vec::with_capacity(download.size.unwrap_or(0) as usize);
        download
            .download_stream
            .read_to_end(&mut buf)
            .await
            .with_context(|| format!("read blob {from}"))?;
        Ok((Bytes::from(buf), download.metadata))
    }

    /// Copies a blob into `sink`, reporting the running byte count through
    /// `progress` after every write. Returns the byte total and metadata.
    pub async fn get_to_stream<W>(
        &self,
        from: &RemotePath,
        sink: &mut W,
        mut progress: Option<ProgressCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<(u64, StorageMetadata), StorageError>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut download = self.get(from, cancel).await?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = download
                .download_stream
                .read(&mut buf)
                .await
                .with_context(|| format!("read blob {from}"))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .await
                .context("write downloaded bytes to sink")?;
            total += n as u64;
            if let Some(cb) = progress.as_mut() {
                cb(total);
            }
        }
        sink.flush().await.context("flush sink")?;
        Ok((total, download.metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_rejects_absolute() {
        RemotePath::from_string("/absolute/key").expect_err("absolute paths are not keys");
        let p = RemotePath::from_string("a/b/c/basebackup").unwrap();
        assert_eq!(p.object_name(), Some("basebackup"));
        assert_eq!(p.join("chunk").to_string(), "a/b/c/basebackup/chunk");
    }

    #[test]
    fn storage_config_toml_round_trip() {
        let toml_text = r#"
            kind = "local-fs"
            local_path = "/var/lib/pgvault/store"
        "#;
        let config: BlobStorageConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(
            config,
            BlobStorageConfig::LocalFs {
                local_path: Utf8PathBuf::from("/var/lib/pgvault/store")
            }
        );

        let toml_text = r#"
            kind = "aws-s3"
            bucket_name = "backups"
            bucket_region = "eu-north-1"
            prefix_in_bucket = "prod"
        "#;
        let config: BlobStorageConfig = toml::from_str(toml_text).unwrap();
        match config {
            BlobStorageConfig::AwsS3(s3) => {
                assert_eq!(s3.bucket_name, "backups");
                assert_eq!(s3.prefix_in_bucket.as_deref(), Some("prod"));
                assert_eq!(s3.concurrency_limit.get(), DEFAULT_S3_CONCURRENCY_LIMIT);
            }
            other => panic!("expected s3 config, got {other:?}"),
        }
    }
}
