//! Content-addressed reuse of data files across backups.
//!
//! A delta backup hashes every file above the configured size floor and
//! uploads only the hashes no surviving manifest already records; files
//! below the floor are inlined into regular chunks. Uploads are
//! content-addressed under `basebackup_delta/<hex-digest>`, so a race
//! between two backups is harmless: the loser observes the existing blob
//! and skips the reupload.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::Context;
use blob_store::{GenericBlobStorage, StorageError};
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::COMPRESSION_ALGORITHM_META;
use crate::compression::{self, CompressionConfig};
use crate::config::SiteConfig;
use crate::encryption::{ActiveEncryption, BoxedWriter, ENCRYPTION_KEY_ID_META};
use crate::listing::{self, BackupEntry};
use crate::manifest::{BackupFormat, DeltaFileEntry};
use crate::metrics::{DELTA_FILES_REUSED, DELTA_FILES_UPLOADED, UPLOADED_BYTES};
use crate::walker::WalkEntry;

/// Manifest formats whose `delta_stats.hashes` participate in the reuse
/// union. `v1` archives predate delta stats and are skipped; `v2` is
/// included because local-tar backups may record stats without being delta
/// backups themselves.
pub const DELTA_HASH_SOURCE_FORMATS: &[BackupFormat] = &[
    BackupFormat::V2,
    BackupFormat::DeltaV1,
    BackupFormat::DeltaV2,
];

const UPLOAD_WARN_THRESHOLD: u32 = 3;
const UPLOAD_MAX_RETRIES: u32 = 8;

pub struct DeltaEngine {
    site_name: String,
    site: SiteConfig,
    storage: GenericBlobStorage,
    compression: CompressionConfig,
    encryption: Option<ActiveEncryption>,
    scratch_dir: Utf8PathBuf,
}

#[derive(Debug, Default)]
pub struct DeltaOutcome {
    /// Entries to pack into regular chunks: every directory plus the files
    /// below the size floor.
    pub inline_entries: Vec<WalkEntry>,
    /// References to content-addressed blobs, reused or freshly uploaded.
    pub delta_files: Vec<DeltaFileEntry>,
    pub uploaded_count: u64,
    pub reused_count: u64,
    pub uploaded_bytes: u64,
}

impl DeltaEngine {
    pub fn new(
        site_name: impl Into<String>,
        site: SiteConfig,
        storage: GenericBlobStorage,
        compression: CompressionConfig,
        encryption: Option<ActiveEncryption>,
        scratch_dir: Utf8PathBuf,
    ) -> Self {
        DeltaEngine {
            site_name: site_name.into(),
            site,
            storage,
            compression,
            encryption,
            scratch_dir,
        }
    }

    /// Merges `delta_stats.hashes` of every recent manifest whose format
    /// participates in reuse into one digest → length map.
    pub async fn fetch_all_hashes(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<BTreeMap<String, u64>> {
        let backups =
            listing::list_site_basebackups(&self.storage, &self.site, cancel).await?;
        let mut union = BTreeMap::new();
        for backup in backups {
            if !self.hash_source(&backup) {
                continue;
            }
            let manifest = match listing::fetch_backup_manifest(
                &self.storage,
                &self.site,
                &backup.name,
                cancel,
            )
            .await
            {
                Ok(manifest) => manifest,
                // Deleted by retention between listing and fetch.
                Err(e) if e.downcast_ref::<StorageError>()
                    .is_some_and(|s| matches!(s, StorageError::NotFound)) =>
                {
                    warn!("backup {} disappeared while merging hashes", backup.name);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(stats) = manifest.delta_stats {
                union.extend(stats.hashes);
            }
        }
        debug!("merged {} known delta hashes", union.len());
        Ok(union)
    }

    fn hash_source(&self, backup: &BackupEntry) -> bool {
        backup
            .format()
            .is_some_and(|format| DELTA_HASH_SOURCE_FORMATS.contains(&format))
    }

    /// Splits the walked entries into inline material and delta
    /// references, uploading novel blobs with `parallel_jobs` workers.
    pub async fn process_entries(
        &self,
        entries: Vec<WalkEntry>,
        known_hashes: &BTreeMap<String, u64>,
        parallel_jobs: usize,
        cancel: &CancellationToken,
    ) -> anyhow::Result<DeltaOutcome> {
        anyhow::ensure!(parallel_jobs >= 1, "parallel_jobs must be >= 1");

        let mut outcome = DeltaOutcome::default();
        let mut candidates = Vec::new();
        for entry in entries {
            if !entry.is_directory
                && entry.file_size >= self.site.basebackup_delta_mode_min_delta_file_size
            {
                candidates.push(entry);
            } else {
                outcome.inline_entries.push(entry);
            }
        }

        // Bounded pool of in-flight files; results keep walk order so the
        // manifest stays deterministic.
        let mut uploads = FuturesOrdered::new();
        let mut iter = candidates.iter();
        loop {
            let added = match iter.next() {
                Some(entry) => {
                    uploads.push_back(self.process_file(entry, known_hashes, cancel));
                    true
                }
                None => false,
            };

            if !added || uploads.len() >= parallel_jobs {
                match uploads.next().await {
                    Some(result) => {
                        if let Some(processed) = result? {
                            if processed.uploaded {
                                outcome.uploaded_count += 1;
                                outcome.uploaded_bytes += processed.stored_bytes;
                            } else {
                                outcome.reused_count += 1;
                            }
                            outcome.delta_files.push(processed.reference);
                        }
                    }
                    None => break,
                }
            }
        }

        info!(
            site = %self.site_name,
            uploaded = outcome.uploaded_count,
            reused = outcome.reused_count,
            inlined = outcome.inline_entries.len(),
            "delta pass finished"
        );
        Ok(outcome)
    }

    async fn process_file(
        &self,
        entry: &WalkEntry,
        known_hashes: &BTreeMap<String, u64>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<ProcessedFile>> {
        if cancel.is_cancelled() {
            anyhow::bail!("delta processing cancelled");
        }

        let hashed = match hash_file(&entry.local_path).await {
            Ok(hashed) => hashed,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && entry.missing_ok => {
                debug!("file vanished before hashing: {}", entry.local_path);
                return Ok(None);
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("hash {}", entry.local_path)))
            }
        };

        if known_hashes.contains_key(&hashed.hexdigest) {
            DELTA_FILES_REUSED.with_label_values(&[&self.site_name]).inc();
            return Ok(Some(ProcessedFile {
                reference: DeltaFileEntry {
                    relative_path: entry.archive_path.to_string(),
                    file_size: hashed.file_size,
                    hexdigest: hashed.hexdigest,
                },
                uploaded: false,
                stored_bytes: 0,
            }));
        }

        match self.upload_delta_blob(entry, cancel).await? {
            Some(processed) => Ok(Some(processed)),
            None => Ok(None),
        }
    }

    /// Stages the file compressed and encrypted, rehashing the plain bytes
    /// on the way; the staging-time digest is authoritative in case the
    /// file changed since the decision pass.
    async fn upload_delta_blob(
        &self,
        entry: &WalkEntry,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<ProcessedFile>> {
        let file = match fs::File::open(&entry.local_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && entry.missing_ok => {
                debug!("file vanished before delta upload: {}", entry.local_path);
                return Ok(None);
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("open {}", entry.local_path)))
            }
        };

        fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| format!("create scratch directory {:?}", self.scratch_dir))?;
        let staging = self
            .scratch_dir
            .join(format!("delta.{:08x}.tmp", rand::random::<u32>()));
        let staging = scopeguard::guard(staging, |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove staging file {path:?}: {e}");
                }
            }
        });

        let (hexdigest, file_size) = {
            let out = fs::File::create(&*staging)
                .await
                .with_context(|| format!("create staging file {:?}", *staging))?;
            let writer: BoxedWriter = match &self.encryption {
                Some(encryption) => encryption.wrap_writer(BufWriter::new(out)).await?,
                None => Box::new(BufWriter::new(out)),
            };
            let mut compressed = compression::encoder(self.compression, writer);
            let mut reader = HashingReader::new(file);
            tokio::io::copy(&mut reader, &mut compressed)
                .await
                .with_context(|| format!("stage delta file {}", entry.local_path))?;
            compressed
                .shutdown()
                .await
                .context("flush staged delta file")?;
            let (count, hexdigest) = reader.finish();
            (hexdigest, count)
        };

        let key = self.site.delta_file_key(&hexdigest);
        let stored_bytes = fs::metadata(&*staging)
            .await
            .context("stat staged delta file")?
            .len();

        // Idempotent by key: if another backup got there first, the
        // content is identical and the existing blob serves.
        match self.storage.get_metadata(&key, cancel).await {
            Ok(_) => {
                debug!("delta blob {key} already present, skipping upload");
                DELTA_FILES_REUSED.with_label_values(&[&self.site_name]).inc();
                return Ok(Some(ProcessedFile {
                    reference: DeltaFileEntry {
                        relative_path: entry.archive_path.to_string(),
                        file_size,
                        hexdigest,
                    },
                    uploaded: false,
                    stored_bytes: 0,
                }));
            }
            Err(StorageError::NotFound) => {}
            Err(e) => return Err(anyhow::Error::new(e).context("probe delta blob")),
        }

        let mut metadata = blob_store::StorageMetadata::new();
        metadata.insert(COMPRESSION_ALGORITHM_META, self.compression.algorithm.as_str());
        if let Some(encryption) = &self.encryption {
            metadata.insert(ENCRYPTION_KEY_ID_META, encryption.key_id.as_str());
        }

        utils::backoff::retry(
            || async {
                let staged = fs::File::open(&*staging)
                    .await
                    .context("open staged delta file")
                    .map_err(StorageError::Other)?;
                self.storage
                    .put(
                        &key,
                        Box::pin(staged),
                        stored_bytes as usize,
                        &metadata,
                        cancel,
                    )
                    .await
            },
            StorageError::is_permanent,
            UPLOAD_WARN_THRESHOLD,
            UPLOAD_MAX_RETRIES,
            "upload delta blob",
            cancel,
        )
        .await
        .ok_or_else(|| anyhow::anyhow!("delta upload cancelled"))?
        .with_context(|| format!("upload delta blob {key}"))?;

        DELTA_FILES_UPLOADED.with_label_values(&[&self.site_name]).inc();
        UPLOADED_BYTES
            .with_label_values(&[&self.site_name])
            .inc_by(stored_bytes);

        Ok(Some(ProcessedFile {
            reference: DeltaFileEntry {
                relative_path: entry.archive_path.to_string(),
                file_size,
                hexdigest,
            },
            uploaded: true,
            stored_bytes,
        }))
    }
}

struct ProcessedFile {
    reference: DeltaFileEntry,
    uploaded: bool,
    stored_bytes: u64,
}

pub(crate) struct HashedFile {
    pub(crate) hexdigest: String,
    pub(crate) file_size: u64,
}

/// SHA-256 and length of a file's contents, streamed.
pub(crate) async fn hash_file(path: &Utf8Path) -> std::io::Result<HashedFile> {
    use tokio::io::AsyncReadExt;

    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut file_size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file_size += n as u64;
    }
    Ok(HashedFile {
        hexdigest: hex::encode(hasher.finalize()),
        file_size,
    })
}

/// Passes reads through while hashing and counting the delivered bytes.
pub(crate) struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R> HashingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        HashingReader {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub(crate) fn finish(self) -> (u64, String) {
        (self.count, hex::encode(self.hasher.finalize()))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let this = self.as_mut().get_mut();
            let filled = buf.filled();
            this.hasher.update(&filled[before..]);
            this.count += (filled.len() - before) as u64;
        }
        result
    }
}
