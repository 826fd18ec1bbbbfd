//! The backup executor: one end-to-end base backup of one site.
//!
//! A backup moves through `Preparing → Running → Finalizing → Done`, or to
//! `Failed` from anywhere. The manifest key write at the end of
//! finalization is the only step that makes the backup visible; everything
//! uploaded before it is an orphan until then, and stays behind as an
//! orphan on failure for a later retention pass to sweep.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::Context;
use blob_store::{GenericBlobStorage, RemotePath, StorageError, StorageMetadata};
use camino::Utf8PathBuf;
use chrono::Utc;
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunk::{ChunkUploader, ChunkUploadResult, COMPRESSION_ALGORITHM_META};
use crate::compression;
use crate::config::{ActiveBackupMode, SiteConfig};
use crate::delta::DeltaEngine;
use crate::encryption::{ActiveEncryption, BoxedWriter, ENCRYPTION_KEY_ID_META};
use crate::listing::meta_keys;
use crate::manifest::{
    self, BackupFormat, BackupManifest, ChunkInfo, DeltaStats, TablespaceInfo,
};
use crate::metrics::{BACKUPS_COMPLETED, BACKUPS_FAILED, BACKUPS_STARTED, RUNNING_BACKUPS};
use crate::pg::{pg_basebackup_command, PostgresApi, StoppedBackup, PG_WAL_DIR_VERSION};
use crate::scheduler::BackupStub;
use crate::walker::{self, WalkedTablespace};

/// How much of a piped archive is teed into memory for label extraction;
/// `backup_label` is the first member of the stream.
const PIPE_LABEL_CAPTURE_BYTES: usize = 128 * 1024;

const MANIFEST_UPLOAD_WARN_THRESHOLD: u32 = 3;
const MANIFEST_UPLOAD_MAX_RETRIES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasebackupMode {
    Basic,
    Pipe,
    LocalTar,
    LocalTarDeltaStats,
    Delta,
}

impl BasebackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BasebackupMode::Basic => "basic",
            BasebackupMode::Pipe => "pipe",
            BasebackupMode::LocalTar => "local-tar",
            BasebackupMode::LocalTarDeltaStats => "local-tar-delta-stats",
            BasebackupMode::Delta => "delta",
        }
    }

    pub fn format(&self) -> BackupFormat {
        match self {
            BasebackupMode::Basic | BasebackupMode::Pipe => BackupFormat::V1,
            BasebackupMode::LocalTar | BasebackupMode::LocalTarDeltaStats => BackupFormat::V2,
            BasebackupMode::Delta => BackupFormat::DeltaV2,
        }
    }
}

impl fmt::Display for BasebackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BasebackupMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(BasebackupMode::Basic),
            "pipe" => Ok(BasebackupMode::Pipe),
            "local-tar" | "local_tar" => Ok(BasebackupMode::LocalTar),
            "local-tar-delta-stats" | "local_tar_delta_stats" => {
                Ok(BasebackupMode::LocalTarDeltaStats)
            }
            "delta" => Ok(BasebackupMode::Delta),
            other => anyhow::bail!("unsupported basebackup mode {other:?}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("PostgreSQL connection was lost during backup process.")]
    ConnectionLost,
    #[error("unsupported basebackup mode {0:?}")]
    UnsupportedMode(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The outcome delivered on the callback channel.
#[derive(Debug)]
pub enum CallbackEvent {
    Success {
        backup_name: String,
        mode: BasebackupMode,
    },
    Failure {
        mode: Option<BasebackupMode>,
        error: BackupError,
    },
}

impl CallbackEvent {
    pub fn success(&self) -> bool {
        matches!(self, CallbackEvent::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackupState {
    Idle,
    Preparing,
    Running,
    Finalizing,
    Done,
    Failed,
}

pub struct BasebackupJob {
    site_name: String,
    site: SiteConfig,
    storage: GenericBlobStorage,
    pg: Arc<dyn PostgresApi>,
    stub: BackupStub,
    scratch_dir: Utf8PathBuf,
    cancel: CancellationToken,
    encryption: Option<ActiveEncryption>,
    state: BackupState,
}

struct ArchiveOutcome {
    chunks: Vec<ChunkUploadResult>,
    delta_files: Vec<manifest::DeltaFileEntry>,
    delta_stats: Option<DeltaStats>,
    delta_chunks: bool,
}

impl BasebackupJob {
    pub fn new(
        site_name: impl Into<String>,
        site: SiteConfig,
        storage: GenericBlobStorage,
        pg: Arc<dyn PostgresApi>,
        stub: BackupStub,
        scratch_dir: Utf8PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        BasebackupJob {
            site_name: site_name.into(),
            site,
            storage,
            pg,
            stub,
            scratch_dir,
            cancel,
            encryption: None,
            state: BackupState::Idle,
        }
    }

    /// Runs the backup and delivers the outcome on `callback`. Errors end
    /// up in the event, never as a panic or a silently dropped task.
    pub async fn run_safe(mut self, callback: mpsc::Sender<CallbackEvent>) {
        BACKUPS_STARTED.with_label_values(&[&self.site_name]).inc();
        RUNNING_BACKUPS.inc();
        let _running = scopeguard::guard((), |()| RUNNING_BACKUPS.dec());

        let event = match self.run().await {
            Ok((backup_name, mode)) => {
                BACKUPS_COMPLETED.with_label_values(&[&self.site_name]).inc();
                info!(site = %self.site_name, backup = %backup_name, "base backup complete");
                CallbackEvent::Success { backup_name, mode }
            }
            Err((mode, e)) => {
                BACKUPS_FAILED.with_label_values(&[&self.site_name]).inc();
                error!(site = %self.site_name, "base backup failed: {e:#}");
                CallbackEvent::Failure { mode, error: e }
            }
        };
        if callback.send(event).await.is_err() {
            warn!(site = %self.site_name, "backup callback receiver went away");
        }
    }

    async fn run(
        &mut self,
    ) -> Result<(String, BasebackupMode), (Option<BasebackupMode>, BackupError)> {
        let mode = self
            .site
            .basebackup_mode
            .parse::<BasebackupMode>()
            .map_err(|_| {
                (
                    None,
                    BackupError::UnsupportedMode(self.site.basebackup_mode.clone()),
                )
            })?;

        match self.run_mode(mode).await {
            Ok(backup_name) => Ok((backup_name, mode)),
            Err(e) => {
                self.set_state(BackupState::Failed);
                Err((Some(mode), e))
            }
        }
    }

    async fn run_mode(&mut self, mode: BasebackupMode) -> Result<String, BackupError> {
        self.set_state(BackupState::Preparing);
        self.encryption = ActiveEncryption::from_site(&self.site)?;

        if !self.pg.check_connection_alive().await {
            return Err(BackupError::ConnectionLost);
        }

        let backup_name = Utc::now().format("%Y-%m-%d_%H-%M-%S-%3f").to_string();
        info!(site = %self.site_name, backup = %backup_name, %mode, "starting base backup");

        match mode {
            BasebackupMode::Basic => self.run_archive_mode(&backup_name, mode, false).await?,
            BasebackupMode::Pipe => self.run_archive_mode(&backup_name, mode, true).await?,
            BasebackupMode::LocalTar
            | BasebackupMode::LocalTarDeltaStats
            | BasebackupMode::Delta => self.run_local_mode(&backup_name, mode).await?,
        }

        self.set_state(BackupState::Done);
        Ok(backup_name)
    }

    fn set_state(&mut self, state: BackupState) {
        debug!(site = %self.site_name, "backup state {:?} -> {state:?}", self.state);
        self.state = state;
    }

    fn chunk_uploader(&self) -> ChunkUploader {
        ChunkUploader::new(
            self.site_name.clone(),
            self.storage.clone(),
            self.site.compression,
            self.encryption.clone(),
            self.scratch_dir.clone(),
        )
    }

    // ----- basic / pipe ---------------------------------------------------

    async fn run_archive_mode(
        &mut self,
        backup_name: &str,
        mode: BasebackupMode,
        pipe: bool,
    ) -> Result<(), BackupError> {
        let pg_version = self
            .pg
            .server_version_num()
            .await
            .context("query server version")?;

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| format!("create scratch directory {:?}", self.scratch_dir))?;
        let staging = self
            .scratch_dir
            .join(format!("{backup_name}.{:08x}.tmp", rand::random::<u32>()));
        let staging_guard = scopeguard::guard(staging.clone(), |path| {
            let _ = std::fs::remove_file(path);
        });

        self.set_state(BackupState::Running);
        let (label, plain_size) = if pipe {
            self.stream_pg_basebackup(&staging).await?
        } else {
            self.stage_pg_basebackup(&staging).await?
        };
        let (start_wal_segment, start_time) = label;

        self.set_state(BackupState::Finalizing);
        let stored_size = tokio::fs::metadata(&staging)
            .await
            .context("stat staged archive")?
            .len();

        let mut metadata = self.backup_metadata(
            mode,
            &start_wal_segment,
            &start_time,
            pg_version,
            None,
            plain_size,
            stored_size,
        );
        metadata.insert(
            COMPRESSION_ALGORITHM_META,
            self.site.compression.algorithm.as_str(),
        );
        if let Some(encryption) = &self.encryption {
            metadata.insert(ENCRYPTION_KEY_ID_META, encryption.key_id.as_str());
        }

        let key = self.site.basebackup_key(backup_name);
        utils::backoff::retry(
            || async {
                let file = tokio::fs::File::open(&staging)
                    .await
                    .context("open staged archive")
                    .map_err(StorageError::Other)?;
                self.storage
                    .put(
                        &key,
                        Box::pin(file),
                        stored_size as usize,
                        &metadata,
                        &self.cancel,
                    )
                    .await
            },
            StorageError::is_permanent,
            MANIFEST_UPLOAD_WARN_THRESHOLD,
            MANIFEST_UPLOAD_MAX_RETRIES,
            "upload basebackup archive",
            &self.cancel,
        )
        .await
        .ok_or_else(|| anyhow::anyhow!("archive upload cancelled"))?
        .with_context(|| format!("upload basebackup archive {key}"))?;

        drop(staging_guard);
        Ok(())
    }

    /// `basic`: materialize the whole tar locally, then compress, encrypt
    /// and upload it as one blob.
    async fn stage_pg_basebackup(
        &self,
        staging: &Utf8PathBuf,
    ) -> anyhow::Result<((String, String), u64)> {
        let target_dir = self
            .scratch_dir
            .join(format!("pg_basebackup.{:08x}", rand::random::<u32>()));
        tokio::fs::create_dir_all(&target_dir)
            .await
            .context("create pg_basebackup target directory")?;
        let target_guard = scopeguard::guard(target_dir.clone(), |path| {
            let _ = std::fs::remove_dir_all(path);
        });

        let output = pg_basebackup_command(&self.site, &target_dir)
            .output()
            .await
            .context("spawn pg_basebackup")?;
        if !output.status.success() {
            anyhow::bail!(
                "pg_basebackup failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let base_tar = target_dir.join("base.tar");
        let mut produced = Vec::new();
        let mut dir = tokio::fs::read_dir(&target_dir)
            .await
            .context("list pg_basebackup output")?;
        while let Some(entry) = dir.next_entry().await.context("list pg_basebackup output")? {
            produced.push(entry.file_name().to_string_lossy().to_string());
        }
        if produced.iter().any(|name| name != "base.tar") {
            // Tablespaces come out as separate per-oid archives which a
            // single-blob backup cannot represent.
            anyhow::bail!(
                "pg_basebackup produced {produced:?}; clusters with tablespaces need the local-tar or delta mode"
            );
        }

        let label = {
            let file = tokio::fs::File::open(&base_tar)
                .await
                .context("open pg_basebackup archive")?;
            manifest::parse_backup_label_in_tar(tokio::io::BufReader::new(file)).await?
        };

        let plain_size = tokio::fs::metadata(&base_tar)
            .await
            .context("stat pg_basebackup archive")?
            .len();

        let mut reader = tokio::fs::File::open(&base_tar)
            .await
            .context("open pg_basebackup archive")?;
        let mut writer = self.open_staging_pipeline(staging).await?;
        tokio::io::copy(&mut reader, &mut writer)
            .await
            .context("compress staged archive")?;
        writer.shutdown().await.context("flush staged archive")?;

        drop(target_guard);
        Ok((label, plain_size))
    }

    /// `pipe`: stream the archive straight through the compressor and
    /// encryptor, teeing the head of the stream for label extraction.
    async fn stream_pg_basebackup(
        &self,
        staging: &Utf8PathBuf,
    ) -> anyhow::Result<((String, String), u64)> {
        let mut command = pg_basebackup_command(&self.site, camino::Utf8Path::new("-"));
        command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let mut child = command.spawn().context("spawn pg_basebackup")?;
        let stdout = child.stdout.take().expect("stdout requested above");

        let mut tee = TeeCapture::new(stdout, PIPE_LABEL_CAPTURE_BYTES);
        let mut writer = self.open_staging_pipeline(staging).await?;
        let copy_result = tokio::io::copy(&mut tee, &mut writer).await;
        let shutdown_result = writer.shutdown().await;

        let mut stderr_text = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            use tokio::io::AsyncReadExt;
            let _ = stderr.read_to_string(&mut stderr_text).await;
        }
        let status = child.wait().await.context("wait for pg_basebackup")?;

        let plain_size = copy_result.context("stream pg_basebackup output")?;
        shutdown_result.context("flush staged archive")?;
        if !status.success() {
            anyhow::bail!(
                "pg_basebackup failed with {status}: {}",
                stderr_text.trim()
            );
        }

        let label =
            manifest::parse_backup_label_in_tar(std::io::Cursor::new(tee.captured())).await?;
        Ok((label, plain_size))
    }

    async fn open_staging_pipeline(
        &self,
        staging: &Utf8PathBuf,
    ) -> anyhow::Result<Box<dyn tokio::io::AsyncWrite + Send + Sync + Unpin>> {
        let file = tokio::fs::File::create(staging)
            .await
            .with_context(|| format!("create staging file {staging:?}"))?;
        let writer: BoxedWriter = match &self.encryption {
            Some(encryption) => encryption.wrap_writer(BufWriter::new(file)).await?,
            None => Box::new(BufWriter::new(file)),
        };
        Ok(compression::encoder(self.site.compression, writer))
    }

    // ----- local-tar / delta ----------------------------------------------

    async fn run_local_mode(
        &mut self,
        backup_name: &str,
        mode: BasebackupMode,
    ) -> Result<(), BackupError> {
        let pg_version = self
            .pg
            .server_version_num()
            .await
            .context("query server version")?;
        let pg_tablespaces = self
            .pg
            .list_tablespaces()
            .await
            .context("list tablespaces")?;
        let tablespaces: BTreeMap<String, WalkedTablespace> = pg_tablespaces
            .iter()
            .map(|ts| {
                (
                    ts.name.clone(),
                    WalkedTablespace {
                        oid: ts.oid,
                        path: Utf8PathBuf::from(&ts.path),
                    },
                )
            })
            .collect();

        self.pg
            .start_backup("pgvault_base_backup")
            .await
            .context("start backup barrier")?;

        // The barrier is open; close it no matter how archival went, then
        // sort out whose error wins.
        let archived = self.archive_cluster(backup_name, mode, &tablespaces).await;

        if !self.pg.check_connection_alive().await {
            return Err(BackupError::ConnectionLost);
        }

        let stopped = self.pg.stop_backup().await;
        let outcome = match (archived, stopped) {
            (Ok(outcome), Ok(stopped)) => (outcome, stopped),
            (Err(e), stop_result) => {
                if let Err(stop_err) = stop_result {
                    warn!("stop_backup also failed after archival error: {stop_err:#}");
                }
                return Err(BackupError::Other(e));
            }
            (Ok(_), Err(stop_err)) => {
                return Err(BackupError::Other(
                    stop_err.context("stop backup barrier"),
                ))
            }
        };
        let (outcome, stopped) = outcome;

        self.set_state(BackupState::Finalizing);
        self.finalize_local_backup(
            backup_name,
            mode,
            pg_version,
            &pg_tablespaces,
            outcome,
            stopped,
        )
        .await
        .map_err(BackupError::Other)
    }

    async fn archive_cluster(
        &mut self,
        backup_name: &str,
        mode: BasebackupMode,
        tablespaces: &BTreeMap<String, WalkedTablespace>,
    ) -> anyhow::Result<ArchiveOutcome> {
        self.set_state(BackupState::Running);
        let pgdata = self.site.pg_data_directory.clone();

        match mode {
            BasebackupMode::LocalTar | BasebackupMode::LocalTarDeltaStats => {
                let (total_entries, chunks) =
                    walker::find_and_split(&pgdata, tablespaces, self.site.basebackup_chunk_size)?;
                info!(
                    site = %self.site_name,
                    total_entries,
                    chunks = chunks.len(),
                    "cluster enumerated"
                );
                let hash_threshold = (mode == BasebackupMode::LocalTarDeltaStats)
                    .then_some(self.site.basebackup_delta_mode_min_delta_file_size);
                let results = self
                    .upload_chunks(backup_name, chunks, hash_threshold, false)
                    .await?;

                let delta_stats = hash_threshold.map(|_| {
                    let mut hashes = BTreeMap::new();
                    for chunk in &results {
                        hashes.extend(chunk.hashes.clone());
                    }
                    DeltaStats { hashes }
                });
                Ok(ArchiveOutcome {
                    chunks: results,
                    delta_files: Vec::new(),
                    delta_stats,
                    delta_chunks: false,
                })
            }
            BasebackupMode::Delta => {
                let engine = DeltaEngine::new(
                    self.site_name.clone(),
                    self.site.clone(),
                    self.storage.clone(),
                    self.site.compression,
                    self.encryption.clone(),
                    self.scratch_dir.clone(),
                );
                let known_hashes = engine.fetch_all_hashes(&self.cancel).await?;
                let entries: Vec<_> = walker::snapshot_entries(&pgdata, tablespaces)
                    .collect::<anyhow::Result<_>>()?;
                let delta_outcome = engine
                    .process_entries(
                        entries,
                        &known_hashes,
                        self.site.basebackup_parallel_jobs,
                        &self.cancel,
                    )
                    .await?;

                let (_, chunks) = walker::split_entries(
                    delta_outcome.inline_entries.into_iter().map(Ok),
                    self.site.basebackup_delta_mode_chunk_size,
                )?;
                let results = self.upload_chunks(backup_name, chunks, None, true).await?;

                let hashes = delta_outcome
                    .delta_files
                    .iter()
                    .map(|f| (f.hexdigest.clone(), f.file_size))
                    .collect();
                Ok(ArchiveOutcome {
                    chunks: results,
                    delta_files: delta_outcome.delta_files,
                    delta_stats: Some(DeltaStats { hashes }),
                    delta_chunks: true,
                })
            }
            BasebackupMode::Basic | BasebackupMode::Pipe => {
                unreachable!("archive modes do not walk the cluster")
            }
        }
    }

    /// Bounded worker pool over the chunk list; results keep chunk order.
    async fn upload_chunks(
        &self,
        backup_name: &str,
        chunks: Vec<Vec<walker::WalkEntry>>,
        hash_threshold: Option<u64>,
        delta: bool,
    ) -> anyhow::Result<Vec<ChunkUploadResult>> {
        let uploader = self.chunk_uploader();
        let mut results = Vec::with_capacity(chunks.len());
        let mut uploads = FuturesOrdered::new();
        let mut iter = chunks.iter().enumerate();

        loop {
            let added = match iter.next() {
                Some((index, entries)) => {
                    let key = self.site.chunk_key(backup_name, index as u64, delta);
                    let uploader = &uploader;
                    let cancel = &self.cancel;
                    uploads.push_back(async move {
                        uploader
                            .upload_chunk(&key, entries, hash_threshold, cancel)
                            .await
                    });
                    true
                }
                None => false,
            };

            if !added || uploads.len() >= self.site.basebackup_parallel_jobs {
                match uploads.next().await {
                    // Dropping the pool on error aborts the other workers
                    // at their next suspension point; finished chunks stay
                    // behind as orphans.
                    Some(result) => results.push(result?),
                    None => break,
                }
            }
        }
        Ok(results)
    }

    /// Archives the start WAL segment (and its directory entry, so the
    /// chunk extracts standalone) as the backup's final chunk. The walker
    /// skips WAL on purpose; a standalone backup needs exactly this one
    /// segment back. A segment already recycled fails the backup: the
    /// archive could not have booted.
    async fn upload_start_wal_chunk(
        &self,
        backup_name: &str,
        start_wal_segment: &str,
        pg_version: u32,
        index: u64,
        delta: bool,
    ) -> anyhow::Result<ChunkUploadResult> {
        let wal_dir = if pg_version >= PG_WAL_DIR_VERSION {
            "pg_wal"
        } else {
            "pg_xlog"
        };
        let local_wal_dir = self.site.pg_data_directory.join(wal_dir);
        let archive_wal_dir = Utf8PathBuf::from(walker::PGDATA_BASE).join(wal_dir);

        let entries = [
            walker::WalkEntry {
                archive_path: archive_wal_dir.clone(),
                local_path: local_wal_dir.clone(),
                file_size: 0,
                is_directory: true,
                missing_ok: false,
            },
            walker::WalkEntry {
                archive_path: archive_wal_dir.join(start_wal_segment),
                local_path: local_wal_dir.join(start_wal_segment),
                file_size: 0,
                is_directory: false,
                missing_ok: false,
            },
        ];

        let key = self.site.chunk_key(backup_name, index, delta);
        self.chunk_uploader()
            .upload_chunk(&key, &entries, None, &self.cancel)
            .await
            .with_context(|| format!("archive start wal segment {start_wal_segment}"))
    }

    async fn finalize_local_backup(
        &self,
        backup_name: &str,
        mode: BasebackupMode,
        pg_version: u32,
        pg_tablespaces: &[crate::pg::PgTablespace],
        outcome: ArchiveOutcome,
        stopped: StoppedBackup,
    ) -> anyhow::Result<()> {
        let ArchiveOutcome {
            mut chunks,
            delta_files,
            delta_stats,
            delta_chunks,
        } = outcome;

        let (start_wal_segment, start_time) =
            manifest::parse_backup_label(&stopped.backup_label)?;

        // A standalone backup must boot without the WAL archive: ship the
        // start segment as one more chunk, now that the label names it.
        if self.site.active_backup_mode == ActiveBackupMode::StandaloneHotBackup {
            let wal_chunk = self
                .upload_start_wal_chunk(
                    backup_name,
                    &start_wal_segment,
                    pg_version,
                    chunks.len() as u64,
                    delta_chunks,
                )
                .await?;
            chunks.push(wal_chunk);
        }

        let tablespaces = pg_tablespaces
            .iter()
            .map(|ts| {
                (
                    ts.name.clone(),
                    TablespaceInfo {
                        oid: ts.oid,
                        path: ts.path.clone(),
                        oid_path: format!("pg_tblspc/{}", ts.oid),
                    },
                )
            })
            .collect();

        let chunk_prefix = if delta_chunks {
            // restore reads chunk names relative to the right prefix
            "basebackup_delta_chunk"
        } else {
            "basebackup_chunk"
        };
        debug!(chunk_prefix, "assembling manifest");

        let manifest = BackupManifest {
            format: mode.format(),
            pg_version: pg_version.to_string(),
            backup_label: stopped.backup_label.clone(),
            chunks: chunks
                .iter()
                .map(|chunk| ChunkInfo {
                    chunk_filename: chunk.chunk_filename.clone(),
                    input_size: chunk.input_size,
                    result_size: chunk.result_size,
                    file_count: chunk.file_count,
                    digest: chunk.digest.clone(),
                })
                .collect(),
            delta_files,
            delta_stats,
            tablespaces,
        };

        let total_plain: u64 = manifest.chunks.iter().map(|c| c.input_size).sum::<u64>()
            + manifest.delta_files.iter().map(|f| f.file_size).sum::<u64>();
        let total_stored: u64 = manifest.chunks.iter().map(|c| c.result_size).sum();

        let mut metadata = self.backup_metadata(
            mode,
            &start_wal_segment,
            &start_time,
            pg_version,
            Some(&stopped),
            total_plain,
            total_stored,
        );

        let manifest_bytes = manifest.to_bytes().await?;
        let manifest_bytes = match &self.encryption {
            Some(encryption) => {
                metadata.insert(ENCRYPTION_KEY_ID_META, encryption.key_id.as_str());
                seal_bytes(encryption, manifest_bytes).await?
            }
            None => manifest_bytes,
        };

        let key = self.site.basebackup_key(backup_name);
        utils::backoff::retry(
            || async {
                self.storage
                    .put_bytes(&key, manifest_bytes.clone(), &metadata, &self.cancel)
                    .await
            },
            StorageError::is_permanent,
            MANIFEST_UPLOAD_WARN_THRESHOLD,
            MANIFEST_UPLOAD_MAX_RETRIES,
            "upload backup manifest",
            &self.cancel,
        )
        .await
        .ok_or_else(|| anyhow::anyhow!("manifest upload cancelled"))?
        .with_context(|| format!("upload backup manifest {key}"))?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn backup_metadata(
        &self,
        mode: BasebackupMode,
        start_wal_segment: &str,
        start_time: &str,
        pg_version: u32,
        stopped: Option<&StoppedBackup>,
        total_plain: u64,
        total_stored: u64,
    ) -> StorageMetadata {
        let mut metadata = StorageMetadata::new();
        metadata.insert(meta_keys::START_TIME, start_time);
        metadata.insert(meta_keys::START_WAL_SEGMENT, start_wal_segment);
        metadata.insert(meta_keys::PG_VERSION, pg_version.to_string());
        metadata.insert(meta_keys::BASEBACKUP_MODE, mode.as_str());
        metadata.insert(
            meta_keys::ACTIVE_BACKUP_MODE,
            self.site.active_backup_mode.as_str(),
        );
        metadata.insert(meta_keys::BACKUP_REASON, self.stub.reason.as_str());
        metadata.insert(
            meta_keys::BACKUP_DECISION_TIME,
            self.stub.decision_time.to_rfc3339(),
        );
        if let Some(normalized) = &self.stub.normalized_backup_time {
            metadata.insert(meta_keys::NORMALIZED_BACKUP_TIME, normalized.as_str());
        }
        metadata.insert(meta_keys::FORMAT, mode.format().as_str());
        metadata.insert(meta_keys::TOTAL_SIZE_PLAIN, total_plain.to_string());
        metadata.insert(meta_keys::TOTAL_SIZE_ENC, total_stored.to_string());
        if let Some(stopped) = stopped {
            metadata.insert(meta_keys::END_TIME, stopped.end_time.to_rfc3339());
            if let Some(end_wal_segment) = &stopped.end_wal_segment {
                metadata.insert(meta_keys::END_WAL_SEGMENT, end_wal_segment.as_str());
            }
        }
        metadata
    }
}

/// Encrypts a small in-memory blob (the manifest) through the same age
/// stream the chunk pipeline uses.
async fn seal_bytes(
    encryption: &ActiveEncryption,
    bytes: bytes::Bytes,
) -> anyhow::Result<bytes::Bytes> {
    use tokio::io::AsyncReadExt;

    let (tx, mut rx) = tokio::io::duplex(64 * 1024);
    let write_side = async {
        let mut writer = encryption.wrap_writer(tx).await?;
        writer.write_all(&bytes).await.context("encrypt manifest")?;
        writer.shutdown().await.context("encrypt manifest")?;
        Ok::<_, anyhow::Error>(())
    };
    let read_side = async {
        let mut sealed = Vec::new();
        rx.read_to_end(&mut sealed)
            .await
            .context("collect encrypted manifest")?;
        Ok::<_, anyhow::Error>(sealed)
    };
    let ((), sealed) = tokio::try_join!(write_side, read_side)?;
    Ok(bytes::Bytes::from(sealed))
}

/// Reads from `inner`, keeping a copy of the first `cap` bytes.
struct TeeCapture<R> {
    inner: R,
    captured: Vec<u8>,
    cap: usize,
}

impl<R> TeeCapture<R> {
    fn new(inner: R, cap: usize) -> Self {
        TeeCapture {
            inner,
            captured: Vec::new(),
            cap,
        }
    }

    fn captured(&self) -> &[u8] {
        &self.captured
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeCapture<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let this = self.as_mut().get_mut();
            if this.captured.len() < this.cap {
                let new_bytes = &buf.filled()[before..];
                let room = this.cap - this.captured.len();
                this.captured
                    .extend_from_slice(&new_bytes[..new_bytes.len().min(room)]);
            }
        }
        result
    }
}
