//! Packs one chunk of walked entries into a compressed, optionally
//! encrypted tar blob and uploads it.
//!
//! The tar stream is staged to the site's scratch directory first: the
//! blob stores need the exact byte length up front, and a staged file lets
//! a failed upload retry without re-reading the cluster.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::Context;
use blob_store::{GenericBlobStorage, RemotePath, StorageError, StorageMetadata};
use camino::Utf8PathBuf;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::compression::{self, CompressionConfig};
use crate::delta::{hash_file, HashingReader};
use crate::encryption::{ActiveEncryption, BoxedWriter, ENCRYPTION_KEY_ID_META};
use crate::metrics::{CHUNKS_UPLOADED, UPLOADED_BYTES};
use crate::walker::WalkEntry;

pub const COMPRESSION_ALGORITHM_META: &str = "compression-algorithm";

const UPLOAD_WARN_THRESHOLD: u32 = 3;
const UPLOAD_MAX_RETRIES: u32 = 8;

pub struct ChunkUploader {
    site: String,
    storage: GenericBlobStorage,
    compression: CompressionConfig,
    encryption: Option<ActiveEncryption>,
    scratch_dir: Utf8PathBuf,
}

#[derive(Debug)]
pub struct ChunkUploadResult {
    pub chunk_filename: String,
    /// Plain bytes fed into the tar stream.
    pub input_size: u64,
    /// Stored blob size after compression and encryption.
    pub result_size: u64,
    pub file_count: u64,
    /// SHA-256 of the stored blob bytes.
    pub digest: String,
    /// Content hashes of archived files at or above the requested
    /// threshold; empty unless hashes were asked for.
    pub hashes: BTreeMap<String, u64>,
}

impl ChunkUploader {
    pub fn new(
        site: impl Into<String>,
        storage: GenericBlobStorage,
        compression: CompressionConfig,
        encryption: Option<ActiveEncryption>,
        scratch_dir: Utf8PathBuf,
    ) -> Self {
        ChunkUploader {
            site: site.into(),
            storage,
            compression,
            encryption,
            scratch_dir,
        }
    }

    /// Metadata stamped on every blob this uploader writes, so restore can
    /// rebuild the decode pipeline without the site config guessing.
    pub fn blob_metadata(&self) -> StorageMetadata {
        let mut metadata = StorageMetadata::new();
        metadata.insert(
            COMPRESSION_ALGORITHM_META,
            self.compression.algorithm.as_str(),
        );
        if let Some(encryption) = &self.encryption {
            metadata.insert(ENCRYPTION_KEY_ID_META, encryption.key_id.as_str());
        }
        metadata
    }

    /// Archives `entries` in order and uploads the result at `key`.
    /// With `hash_threshold` set, files of at least that many bytes get
    /// their SHA-256 recorded in the result.
    pub async fn upload_chunk(
        &self,
        key: &RemotePath,
        entries: &[WalkEntry],
        hash_threshold: Option<u64>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ChunkUploadResult> {
        let chunk_filename = key
            .object_name()
            .context("chunk key has no object name")?
            .to_string();

        fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| format!("create scratch directory {:?}", self.scratch_dir))?;
        let staging = self
            .scratch_dir
            .join(format!("{chunk_filename}.{:08x}.tmp", rand::random::<u32>()));
        // The staging file is gone whichever way this function exits.
        let staging = scopeguard::guard(staging, |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove staging file {path:?}: {e}");
                }
            }
        });

        let (input_size, file_count, hashes) = self
            .write_archive(&staging, entries, hash_threshold, cancel)
            .await?;

        // restore verifies the download against this digest
        let staged = hash_file(&*staging)
            .await
            .with_context(|| format!("hash staged chunk {:?}", *staging))?;
        let result_size = staged.file_size;

        let metadata = self.blob_metadata();
        utils::backoff::retry(
            || async {
                let file = fs::File::open(&*staging)
                    .await
                    .context("open staged chunk")
                    .map_err(StorageError::Other)?;
                self.storage
                    .put(
                        key,
                        Box::pin(file),
                        result_size as usize,
                        &metadata,
                        cancel,
                    )
                    .await
            },
            StorageError::is_permanent,
            UPLOAD_WARN_THRESHOLD,
            UPLOAD_MAX_RETRIES,
            "upload basebackup chunk",
            cancel,
        )
        .await
        .ok_or_else(|| anyhow::anyhow!("chunk upload cancelled"))?
        .with_context(|| format!("upload chunk {key}"))?;

        CHUNKS_UPLOADED.with_label_values(&[&self.site]).inc();
        UPLOADED_BYTES
            .with_label_values(&[&self.site])
            .inc_by(result_size);
        debug!(
            chunk = %key,
            input_size,
            result_size,
            file_count,
            "chunk uploaded"
        );

        Ok(ChunkUploadResult {
            chunk_filename,
            input_size,
            result_size,
            file_count,
            digest: staged.hexdigest,
            hashes,
        })
    }

    async fn write_archive(
        &self,
        staging: &Utf8PathBuf,
        entries: &[WalkEntry],
        hash_threshold: Option<u64>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(u64, u64, BTreeMap<String, u64>)> {
        let file = fs::File::create(staging)
            .await
            .with_context(|| format!("create staging file {staging:?}"))?;
        let writer: BoxedWriter = match &self.encryption {
            Some(encryption) => encryption.wrap_writer(BufWriter::new(file)).await?,
            None => Box::new(BufWriter::new(file)),
        };
        let compressed = compression::encoder(self.compression, writer);
        let mut archive = tokio_tar::Builder::new(compressed);

        let mut input_size = 0u64;
        let mut file_count = 0u64;
        let mut hashes = BTreeMap::new();

        for entry in entries {
            if cancel.is_cancelled() {
                anyhow::bail!("chunk archival cancelled");
            }
            if entry.is_directory {
                // Non-recursive on purpose: the walker already enumerated
                // the children into their own entries.
                match archive
                    .append_dir(&entry.archive_path, &entry.local_path)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound && entry.missing_ok => {
                        debug!("directory vanished before archival: {}", entry.local_path);
                    }
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("archive directory {}", entry.local_path)))
                    }
                }
                continue;
            }

            let file = match fs::File::open(&entry.local_path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && entry.missing_ok => {
                    debug!("file vanished before archival: {}", entry.local_path);
                    continue;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("archive file {}", entry.local_path)))
                }
            };
            let file_metadata = file
                .metadata()
                .await
                .with_context(|| format!("stat {}", entry.local_path))?;
            let size = file_metadata.len();

            let mut header = tokio_tar::Header::new_gnu();
            header.set_metadata(&file_metadata);

            // Cap at the snapshot size; concurrent appends past it belong
            // to the WAL, not this backup.
            let limited = file.take(size);
            let copied = if hash_threshold.is_some_and(|threshold| size >= threshold) {
                let mut reader = HashingReader::new(limited);
                archive
                    .append_data(&mut header, &entry.archive_path, &mut reader)
                    .await
                    .with_context(|| format!("archive file {}", entry.local_path))?;
                let (copied, hexdigest) = reader.finish();
                hashes.insert(hexdigest, copied);
                copied
            } else {
                let mut reader = CountingReader::new(limited);
                archive
                    .append_data(&mut header, &entry.archive_path, &mut reader)
                    .await
                    .with_context(|| format!("archive file {}", entry.local_path))?;
                reader.count
            };
            if copied != size {
                anyhow::bail!(
                    "file {} shrank from {size} to {copied} bytes during archival",
                    entry.local_path
                );
            }

            input_size += size;
            file_count += 1;
        }

        let mut compressed = archive.into_inner().await.context("finish tar stream")?;
        compressed
            .shutdown()
            .await
            .context("flush compressed chunk")?;

        Ok((input_size, file_count, hashes))
    }
}

/// Passes reads through while counting the delivered bytes.
pub(crate) struct CountingReader<R> {
    inner: R,
    pub(crate) count: u64,
}

impl<R> CountingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        CountingReader { inner, count: 0 }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            self.count += (buf.filled().len() - before) as u64;
        }
        result
    }
}
