//! Reconstructs a data directory from a stored base backup.
//!
//! Validation happens up front and fails with operator-facing messages;
//! after that, blobs download in a bounded pool into staging files, get
//! verified against the manifest, decrypted and decompressed, and extract
//! into the target. Tablespace symlinks are rewritten to the mapped
//! directories, and the restored cluster gets a recovery configuration
//! pointing at the WAL archive.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use blob_store::{GenericBlobStorage, RemotePath, StorageError, StorageMetadata};
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::FuturesOrdered;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::COMPRESSION_ALGORITHM_META;
use crate::compression::{self, CompressionAlgorithm};
use crate::config::SiteConfig;
use crate::delta::hash_file;
use crate::encryption::{self, ENCRYPTION_KEY_ID_META};
use crate::listing::{self, meta_keys, BackupEntry};
use crate::manifest::{BackupFormat, BackupManifest, TablespaceInfo};
use crate::pg::PG_WAL_DIR_VERSION;

const DOWNLOAD_WARN_THRESHOLD: u32 = 2;
const DOWNLOAD_MAX_RETRIES: u32 = 4;

const DEFAULT_RESTORE_COMMAND: &str =
    "pgvault_postgres_command --mode restore --output %p --xlog %f";

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    /// Pre-flight problems the operator has to fix; the message is the
    /// user interface.
    #[error("{0}")]
    Validation(String),
    #[error("data integrity error: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shared byte and object counters updated as a restore downloads; the
/// CLI renders them while the operation runs.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    pub downloaded_bytes: AtomicU64,
    pub completed_blobs: AtomicU64,
    pub total_blobs: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// `None` restores the latest backup.
    pub backup_name: Option<String>,
    pub target_dir: Utf8PathBuf,
    pub tablespace_mapping: HashMap<String, Utf8PathBuf>,
    pub overwrite: bool,
    pub restore_to_primary: bool,
    pub parallel_jobs: usize,
    /// When set, download progress is published here for the caller.
    pub progress: Option<Arc<DownloadProgress>>,
}

impl RestoreOptions {
    pub fn new(target_dir: Utf8PathBuf) -> Self {
        RestoreOptions {
            backup_name: None,
            target_dir,
            tablespace_mapping: HashMap::new(),
            overwrite: false,
            restore_to_primary: false,
            parallel_jobs: 4,
            progress: None,
        }
    }
}

/// Restores one backup; returns the name of the backup that was restored.
pub async fn restore_basebackup(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    options: &RestoreOptions,
    cancel: &CancellationToken,
) -> Result<String, RestoreError> {
    let backups = listing::list_site_basebackups(storage, site, cancel)
        .await
        .context("list available basebackups")?;
    let entry = match &options.backup_name {
        Some(name) => backups
            .iter()
            .find(|b| &b.name == name)
            .ok_or_else(|| RestoreError::Validation(format!("No basebackup {name:?} found")))?,
        None => backups.last().ok_or_else(|| {
            RestoreError::Validation("No basebackups found for the site".to_string())
        })?,
    };
    let format = entry.format().ok_or_else(|| {
        RestoreError::Validation(format!(
            "Basebackup {:?} carries no readable format metadata",
            entry.name
        ))
    })?;

    info!(backup = %entry.name, %format, "restoring basebackup");
    prepare_target_dir(&options.target_dir, options.overwrite)?;

    let pg_version = match format {
        BackupFormat::V1 => {
            if !options.tablespace_mapping.is_empty() {
                let names: Vec<&String> = options.tablespace_mapping.keys().collect();
                return Err(RestoreError::Validation(format!(
                    "Tablespace mapping for {names:?} was requested, but the backup has no tablespaces"
                )));
            }
            if let Some(progress) = &options.progress {
                progress.total_blobs.store(1, Ordering::Relaxed);
            }
            restore_v1(storage, site, entry, options, cancel).await?;
            parse_pg_version(entry)?
        }
        BackupFormat::V2 | BackupFormat::DeltaV1 | BackupFormat::DeltaV2 => {
            let manifest = listing::fetch_backup_manifest(storage, site, &entry.name, cancel)
                .await
                .context("fetch backup manifest")?;
            if let Some(progress) = &options.progress {
                progress.total_blobs.store(
                    (manifest.chunks.len() + manifest.delta_files.len()) as u64,
                    Ordering::Relaxed,
                );
            }
            restore_chunked(storage, site, entry, &manifest, options, cancel).await?;
            manifest
                .pg_version
                .parse()
                .with_context(|| format!("bad pg_version in manifest: {:?}", manifest.pg_version))?
        }
    };

    ensure_wal_dir(&options.target_dir, pg_version)?;
    write_recovery_config(site, &options.target_dir, pg_version, options.restore_to_primary)?;

    Ok(entry.name.clone())
}

fn parse_pg_version(entry: &BackupEntry) -> Result<u32, RestoreError> {
    let raw = entry
        .metadata
        .get(meta_keys::PG_VERSION)
        .ok_or_else(|| RestoreError::Validation("backup has no pg-version metadata".into()))?;
    raw.parse()
        .with_context(|| format!("bad pg-version metadata {raw:?}"))
        .map_err(RestoreError::Other)
}

fn prepare_target_dir(target: &Utf8Path, overwrite: bool) -> Result<(), RestoreError> {
    if target.exists() {
        let occupied = target
            .read_dir_utf8()
            .with_context(|| format!("read target directory {target}"))
            .map_err(RestoreError::Other)?
            .next()
            .is_some();
        if occupied {
            if !overwrite {
                return Err(RestoreError::Validation(format!(
                    "Target directory '{target}' exists and is not empty, --overwrite not specified"
                )));
            }
            std::fs::remove_dir_all(target)
                .with_context(|| format!("clear target directory {target}"))
                .map_err(RestoreError::Other)?;
        }
    }
    std::fs::create_dir_all(target)
        .with_context(|| format!("create target directory {target}"))
        .map_err(RestoreError::Other)?;
    Ok(())
}

/// Resolves each tablespace of the backup to the directory it restores
/// into, validating every directory the way initdb would need it.
fn validate_tablespaces(
    manifest_tablespaces: &BTreeMap<String, TablespaceInfo>,
    mapping: &HashMap<String, Utf8PathBuf>,
) -> Result<BTreeMap<String, Utf8PathBuf>, RestoreError> {
    let mut unknown: Vec<&String> = mapping
        .keys()
        .filter(|name| !manifest_tablespaces.contains_key(*name))
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(RestoreError::Validation(format!(
            "Tablespace mapping for {unknown:?} was requested, but the backup does not contain them"
        )));
    }

    let mut resolved = BTreeMap::new();
    for (name, info) in manifest_tablespaces {
        let dir = mapping
            .get(name)
            .cloned()
            .unwrap_or_else(|| Utf8PathBuf::from(&info.path));
        if !dir.is_dir() {
            return Err(RestoreError::Validation(format!(
                "Tablespace '{name}' target directory '{dir}' does not exist"
            )));
        }
        let occupied = dir
            .read_dir_utf8()
            .with_context(|| format!("read tablespace directory {dir}"))
            .map_err(RestoreError::Other)?
            .next()
            .is_some();
        if occupied {
            return Err(RestoreError::Validation(format!(
                "Tablespace '{name}' target directory '{dir}' exists but is not empty"
            )));
        }
        let probe = dir.join(".pgvault_writable");
        match std::fs::write(&probe, b"") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
            }
            Err(_) => {
                return Err(RestoreError::Validation(format!(
                    "Tablespace '{name}' target directory '{dir}' is empty, but not writable"
                )));
            }
        }
        resolved.insert(name.clone(), dir);
    }
    Ok(resolved)
}

async fn restore_v1(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    entry: &BackupEntry,
    options: &RestoreOptions,
    cancel: &CancellationToken,
) -> Result<(), RestoreError> {
    let key = site.basebackup_key(&entry.name);
    let progress = options.progress.as_ref();
    with_download_retries("download basebackup archive", cancel, || async {
        let staging = staging_guard(fetch_staging_path(&options.target_dir));
        let metadata = fetch_blob_to_file(storage, &key, &staging, progress, cancel).await?;

        let file = tokio::fs::File::open(&*staging)
            .await
            .context("open downloaded archive")?;
        let reader = decode_pipeline(site, &metadata, Box::pin(file)).await?;
        // the protocol archive carries native cluster paths
        extract_archive(reader, &PathMapper::Flat(&options.target_dir))
            .await
            .context("extract basebackup archive")?;
        Ok(())
    })
    .await?;
    note_blob_done(progress);
    Ok(())
}

async fn restore_chunked(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    entry: &BackupEntry,
    manifest: &BackupManifest,
    options: &RestoreOptions,
    cancel: &CancellationToken,
) -> Result<(), RestoreError> {
    let tablespace_dirs = validate_tablespaces(&manifest.tablespaces, &options.tablespace_mapping)?;

    // chunks first: they carry every directory entry the files need
    let delta = manifest.format.is_delta();
    let progress = options.progress.as_ref();
    let mut downloads = FuturesOrdered::new();
    let mut iter = manifest.chunks.iter();
    loop {
        let added = match iter.next() {
            Some(chunk) => {
                let key = site
                    .chunk_prefix(delta)
                    .join(&entry.name)
                    .join(&chunk.chunk_filename);
                let target_dir = &options.target_dir;
                let tablespace_dirs = &tablespace_dirs;
                downloads.push_back(async move {
                    with_download_retries("download backup chunk", cancel, || async {
                        let staging = staging_guard(fetch_staging_path(target_dir));
                        let metadata =
                            fetch_blob_to_file(storage, &key, &staging, progress, cancel).await?;

                        // the stored bytes must be the bytes the backup
                        // recorded before anything gets extracted
                        let staged = hash_file(&*staging)
                            .await
                            .with_context(|| format!("hash downloaded chunk {key}"))?;
                        if staged.file_size != chunk.result_size
                            || staged.hexdigest != chunk.digest
                        {
                            return Err(anyhow::Error::new(RestoreError::Corrupt(format!(
                                "chunk {} digest mismatch: got {} bytes ({}), manifest records {} bytes ({})",
                                chunk.chunk_filename,
                                staged.file_size,
                                staged.hexdigest,
                                chunk.result_size,
                                chunk.digest
                            ))));
                        }

                        let file = tokio::fs::File::open(&*staging)
                            .await
                            .context("open downloaded chunk")?;
                        let reader = decode_pipeline(site, &metadata, Box::pin(file)).await?;
                        let mapper = PathMapper::Prefixed {
                            target: target_dir,
                            tablespaces: tablespace_dirs,
                        };
                        extract_archive(reader, &mapper)
                            .await
                            .with_context(|| format!("extract chunk {key}"))?;
                        Ok(())
                    })
                    .await?;
                    note_blob_done(progress);
                    Ok::<(), RestoreError>(())
                });
                true
            }
            None => false,
        };
        if !added || downloads.len() >= options.parallel_jobs {
            match downloads.next().await {
                Some(result) => result?,
                None => break,
            }
        }
    }

    restore_delta_files(storage, site, manifest, options, &tablespace_dirs, cancel).await?;

    // delta and local-tar archives do not contain backup_label; the
    // manifest carries the verbatim text
    if !manifest.backup_label.is_empty() {
        std::fs::write(options.target_dir.join("backup_label"), &manifest.backup_label)
            .context("write backup_label")
            .map_err(RestoreError::Other)?;
    }

    create_tablespace_symlinks(&options.target_dir, &manifest.tablespaces, &tablespace_dirs)?;
    Ok(())
}

async fn restore_delta_files(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    manifest: &BackupManifest,
    options: &RestoreOptions,
    tablespace_dirs: &BTreeMap<String, Utf8PathBuf>,
    cancel: &CancellationToken,
) -> Result<(), RestoreError> {
    let mapper = PathMapper::Prefixed {
        target: &options.target_dir,
        tablespaces: tablespace_dirs,
    };
    let progress = options.progress.as_ref();

    let mut downloads = FuturesOrdered::new();
    let mut iter = manifest.delta_files.iter();
    loop {
        let added = match iter.next() {
            Some(delta_file) => {
                let key = site.delta_file_key(&delta_file.hexdigest);
                let mapper = &mapper;
                let target_dir = &options.target_dir;
                downloads.push_back(async move {
                    let destination = mapper
                        .map(Utf8Path::new(&delta_file.relative_path))
                        .map_err(RestoreError::Other)?
                        .ok_or_else(|| {
                            RestoreError::Corrupt(format!(
                                "delta file {} maps outside the restore targets",
                                delta_file.relative_path
                            ))
                        })?;
                    with_download_retries("download delta file", cancel, || async {
                        let staging = staging_guard(fetch_staging_path(target_dir));
                        let metadata =
                            fetch_blob_to_file(storage, &key, &staging, progress, cancel).await?;

                        let file = tokio::fs::File::open(&*staging)
                            .await
                            .context("open downloaded delta file")?;
                        let mut reader = decode_pipeline(site, &metadata, Box::pin(file)).await?;
                        if let Some(parent) = destination.parent() {
                            tokio::fs::create_dir_all(parent)
                                .await
                                .with_context(|| format!("create directories for {destination}"))?;
                        }
                        let mut out = tokio::fs::File::create(&destination)
                            .await
                            .with_context(|| format!("create {destination}"))?;
                        let written = tokio::io::copy(&mut reader, &mut out)
                            .await
                            .with_context(|| format!("write {destination}"))?;
                        // a stored blob disagreeing with its recorded
                        // length is corruption, not a soft mismatch
                        if written != delta_file.file_size {
                            return Err(anyhow::Error::new(RestoreError::Corrupt(format!(
                                "delta file {} restored {written} bytes, manifest records {}",
                                delta_file.relative_path, delta_file.file_size
                            ))));
                        }
                        Ok(())
                    })
                    .await?;
                    note_blob_done(progress);
                    Ok::<(), RestoreError>(())
                });
                true
            }
            None => false,
        };
        if !added || downloads.len() >= options.parallel_jobs {
            match downloads.next().await {
                Some(result) => result?,
                None => break,
            }
        }
    }
    Ok(())
}

fn fetch_staging_path(target_dir: &Utf8Path) -> Utf8PathBuf {
    target_dir.join(format!(".pgvault_fetch.{:08x}", rand::random::<u32>()))
}

fn staging_guard(path: Utf8PathBuf) -> scopeguard::ScopeGuard<Utf8PathBuf, impl FnOnce(Utf8PathBuf)> {
    scopeguard::guard(path, |path| {
        let _ = std::fs::remove_file(path);
    })
}

fn note_blob_done(progress: Option<&Arc<DownloadProgress>>) {
    if let Some(progress) = progress {
        progress.completed_blobs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Downloads one blob into `path` through the gateway's streaming copy,
/// publishing the running byte count as it goes. Returns the blob's
/// metadata for the decode pipeline.
async fn fetch_blob_to_file(
    storage: &GenericBlobStorage,
    key: &RemotePath,
    path: &Utf8Path,
    progress: Option<&Arc<DownloadProgress>>,
    cancel: &CancellationToken,
) -> anyhow::Result<StorageMetadata> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create staging file {path:?}"))?;
    let mut last_reported = 0u64;
    let mut on_progress = |copied: u64| {
        if let Some(progress) = progress {
            progress
                .downloaded_bytes
                .fetch_add(copied - last_reported, Ordering::Relaxed);
            last_reported = copied;
        }
    };
    let (_bytes, metadata) = storage
        .get_to_stream(key, &mut file, Some(&mut on_progress), cancel)
        .await
        .map_err(|e| anyhow::Error::new(e).context(format!("download {key}")))?;
    Ok(metadata)
}

fn create_tablespace_symlinks(
    target: &Utf8Path,
    tablespaces: &BTreeMap<String, TablespaceInfo>,
    tablespace_dirs: &BTreeMap<String, Utf8PathBuf>,
) -> Result<(), RestoreError> {
    if tablespaces.is_empty() {
        return Ok(());
    }
    let link_dir = target.join("pg_tblspc");
    std::fs::create_dir_all(&link_dir)
        .context("create pg_tblspc")
        .map_err(RestoreError::Other)?;
    for (name, info) in tablespaces {
        let dir = &tablespace_dirs[name];
        let link = link_dir.join(info.oid.to_string());
        std::os::unix::fs::symlink(dir, &link)
            .with_context(|| format!("symlink {link} -> {dir}"))
            .map_err(RestoreError::Other)?;
        debug!("tablespace {name} linked at {link} -> {dir}");
    }
    Ok(())
}

fn ensure_wal_dir(target: &Utf8Path, pg_version: u32) -> Result<(), RestoreError> {
    let wal_dir = if pg_version >= PG_WAL_DIR_VERSION {
        "pg_wal"
    } else {
        "pg_xlog"
    };
    std::fs::create_dir_all(target.join(wal_dir))
        .with_context(|| format!("create {wal_dir}"))
        .map_err(RestoreError::Other)?;
    Ok(())
}

fn write_recovery_config(
    site: &SiteConfig,
    target: &Utf8Path,
    pg_version: u32,
    restore_to_primary: bool,
) -> Result<(), RestoreError> {
    let restore_command = site
        .restore_command
        .clone()
        .unwrap_or_else(|| DEFAULT_RESTORE_COMMAND.to_string());

    if pg_version >= 120000 {
        let mut settings = format!(
            "\n# recovery settings written by pgvault\nrestore_command = '{restore_command}'\n"
        );
        settings.push_str("recovery_target_timeline = 'latest'\n");
        let auto_conf = target.join("postgresql.auto.conf");
        let mut existing = std::fs::read_to_string(&auto_conf).unwrap_or_default();
        existing.push_str(&settings);
        std::fs::write(&auto_conf, existing)
            .context("write postgresql.auto.conf")
            .map_err(RestoreError::Other)?;
        if !restore_to_primary {
            std::fs::write(target.join("recovery.signal"), b"")
                .context("write recovery.signal")
                .map_err(RestoreError::Other)?;
        }
    } else {
        let mut recovery_conf = format!(
            "restore_command = '{restore_command}'\nrecovery_target_timeline = 'latest'\n"
        );
        if !restore_to_primary {
            recovery_conf.push_str("standby_mode = 'on'\n");
        }
        std::fs::write(target.join("recovery.conf"), recovery_conf)
            .context("write recovery.conf")
            .map_err(RestoreError::Other)?;
    }
    Ok(())
}

async fn with_download_retries<T, F, Fut>(
    description: &str,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, RestoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let mut op = op;
    utils::backoff::retry(
        || op(),
        |e: &anyhow::Error| {
            // storage-level NotFound cannot be retried into existence, and
            // a failed integrity verdict is final
            e.downcast_ref::<StorageError>()
                .is_some_and(StorageError::is_permanent)
                || e.downcast_ref::<RestoreError>().is_some_and(|e| {
                    matches!(e, RestoreError::Validation(_) | RestoreError::Corrupt(_))
                })
        },
        DOWNLOAD_WARN_THRESHOLD,
        DOWNLOAD_MAX_RETRIES,
        description,
        cancel,
    )
    .await
    .ok_or_else(|| RestoreError::Other(anyhow::anyhow!("{description} cancelled")))?
    .map_err(|e| match e.downcast::<RestoreError>() {
        Ok(typed) => typed,
        Err(other) => RestoreError::Other(other),
    })
}

/// Maps archive member paths to filesystem destinations.
enum PathMapper<'a> {
    /// Protocol archives: native cluster paths relative to the target.
    Flat(&'a Utf8Path),
    /// Walker archives: `pgdata/...` and `tablespaces/<name>/...`.
    Prefixed {
        target: &'a Utf8Path,
        tablespaces: &'a BTreeMap<String, Utf8PathBuf>,
    },
}

impl PathMapper<'_> {
    fn map(&self, archive_path: &Utf8Path) -> anyhow::Result<Option<Utf8PathBuf>> {
        let mut components = archive_path.components().peekable();
        // tolerate leading ./ in protocol archives
        if components.peek().map(|c| c.as_str()) == Some(".") {
            components.next();
        }
        let relative: Utf8PathBuf = components.collect();
        if relative.as_str().is_empty() {
            return Ok(None);
        }
        anyhow::ensure!(
            !relative
                .components()
                .any(|c| c.as_str() == ".." || Utf8Path::new(c.as_str()).is_absolute()),
            "archive member {archive_path} escapes the restore target"
        );

        match self {
            PathMapper::Flat(target) => Ok(Some(target.join(relative))),
            PathMapper::Prefixed {
                target,
                tablespaces,
            } => {
                if let Ok(rest) = relative.strip_prefix(crate::walker::PGDATA_BASE) {
                    if rest.as_str().is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(target.join(rest)));
                }
                if let Ok(rest) = relative.strip_prefix(crate::walker::TABLESPACES_BASE) {
                    let mut rest_components = rest.components();
                    let name = match rest_components.next() {
                        Some(c) => c.as_str().to_string(),
                        None => return Ok(None),
                    };
                    let inner: Utf8PathBuf = rest_components.collect();
                    let base = tablespaces
                        .get(&name)
                        .with_context(|| format!("archive references unknown tablespace {name:?}"))?;
                    if inner.as_str().is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(base.join(inner)));
                }
                warn!("skipping archive member outside known roots: {archive_path}");
                Ok(None)
            }
        }
    }
}

async fn extract_archive<R>(reader: R, mapper: &PathMapper<'_>) -> anyhow::Result<u64>
where
    R: AsyncRead + Send + Sync + Unpin,
{
    let mut archive = tokio_tar::Archive::new(reader);
    let mut entries = archive.entries().context("read archive entries")?;
    let mut unpacked = 0u64;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context("read archive entry")?;
        let raw_path = entry.path().context("read archive entry path")?;
        let utf8_path = Utf8Path::from_path(raw_path.as_ref())
            .with_context(|| format!("non-utf8 archive member {raw_path:?}"))?
            .to_path_buf();
        let Some(destination) = mapper.map(&utf8_path)? else {
            continue;
        };
        entry
            .unpack(destination.as_std_path())
            .await
            .with_context(|| format!("unpack {utf8_path} to {destination}"))?;
        unpacked += 1;
    }
    Ok(unpacked)
}

async fn decode_pipeline(
    site: &SiteConfig,
    metadata: &StorageMetadata,
    stream: blob_store::BlobStream,
) -> anyhow::Result<Box<dyn AsyncRead + Send + Sync + Unpin>> {
    let mut reader: Box<dyn AsyncRead + Send + Sync + Unpin> = Box::new(stream);
    if let Some(key_id) = metadata.get(ENCRYPTION_KEY_ID_META) {
        let identity = encryption::identity_for(site, key_id)?;
        reader = encryption::decrypt_reader(&identity, reader).await?;
    }
    if let Some(algorithm) = metadata.get(COMPRESSION_ALGORITHM_META) {
        let algorithm: CompressionAlgorithm = algorithm.parse()?;
        reader = compression::decoder(algorithm, tokio::io::BufReader::new(reader));
    }
    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tablespace(oid: u32, path: &str) -> TablespaceInfo {
        TablespaceInfo {
            oid,
            path: path.to_string(),
            oid_path: format!("pg_tblspc/{oid}"),
        }
    }

    #[test]
    fn target_dir_validation() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path().join("restore");

        // missing directory is created
        prepare_target_dir(&target, false).unwrap();
        assert!(target.is_dir());

        // empty directory passes again
        prepare_target_dir(&target, false).unwrap();

        std::fs::write(target.join("PG_VERSION"), "15\n").unwrap();
        let err = prepare_target_dir(&target, false).unwrap_err();
        assert!(err.to_string().contains("not empty"));
        assert!(err.to_string().contains("--overwrite not specified"));

        // --overwrite clears it
        prepare_target_dir(&target, true).unwrap();
        assert!(target.read_dir_utf8().unwrap().next().is_none());
    }

    #[test]
    fn tablespace_validation_messages() {
        let dir = camino_tempfile::tempdir().unwrap();
        let manifest_ts =
            BTreeMap::from([("tstest".to_string(), tablespace(16385, "/nonexistent/ts"))]);

        // mapping for a tablespace the backup does not have
        let mapping = HashMap::from([
            ("other".to_string(), dir.path().to_path_buf()),
            ("tstest".to_string(), dir.path().to_path_buf()),
        ]);
        let err = validate_tablespaces(&manifest_ts, &mapping).unwrap_err();
        assert!(err
            .to_string()
            .contains("Tablespace mapping for [\"other\"] was requested, but"));

        // unmapped tablespace falls back to its original path, which is gone
        let err = validate_tablespaces(&manifest_ts, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        // mapped to a non-empty directory
        let occupied = dir.path().join("occupied");
        std::fs::create_dir_all(occupied.join("leftover")).unwrap();
        let mapping = HashMap::from([("tstest".to_string(), occupied)]);
        let err = validate_tablespaces(&manifest_ts, &mapping).unwrap_err();
        assert!(err.to_string().contains("not empty"));

        // a valid empty directory resolves
        let good = dir.path().join("good");
        std::fs::create_dir_all(&good).unwrap();
        let mapping = HashMap::from([("tstest".to_string(), good.clone())]);
        let resolved = validate_tablespaces(&manifest_ts, &mapping).unwrap();
        assert_eq!(resolved["tstest"], good);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_tablespace_dir_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = camino_tempfile::tempdir().unwrap();
        let ts_dir = dir.path().join("ts");
        std::fs::create_dir_all(&ts_dir).unwrap();
        std::fs::set_permissions(&ts_dir, std::fs::Permissions::from_mode(0o500)).unwrap();

        let manifest_ts =
            BTreeMap::from([("tstest".to_string(), tablespace(16385, "/nonexistent"))]);
        let mapping = HashMap::from([("tstest".to_string(), ts_dir.clone())]);
        let result = validate_tablespaces(&manifest_ts, &mapping);
        std::fs::set_permissions(&ts_dir, std::fs::Permissions::from_mode(0o700)).unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("empty, but not writable"));
    }

    #[test]
    fn path_mapper_prefixes() {
        let target = Utf8PathBuf::from("/restore/pgdata");
        let ts = BTreeMap::from([("tstest".to_string(), Utf8PathBuf::from("/restore/ts"))]);
        let mapper = PathMapper::Prefixed {
            target: &target,
            tablespaces: &ts,
        };

        assert_eq!(
            mapper.map(Utf8Path::new("pgdata/global/pg_control")).unwrap(),
            Some(Utf8PathBuf::from("/restore/pgdata/global/pg_control"))
        );
        assert_eq!(
            mapper
                .map(Utf8Path::new("tablespaces/tstest/PG_15/16384/2654"))
                .unwrap(),
            Some(Utf8PathBuf::from("/restore/ts/PG_15/16384/2654"))
        );
        assert!(mapper
            .map(Utf8Path::new("tablespaces/unknown/f"))
            .is_err());
        assert!(mapper.map(Utf8Path::new("pgdata/../escape")).is_err());

        let flat = PathMapper::Flat(&target);
        assert_eq!(
            flat.map(Utf8Path::new("./global/pg_control")).unwrap(),
            Some(Utf8PathBuf::from("/restore/pgdata/global/pg_control"))
        );
        assert_eq!(flat.map(Utf8Path::new("./")).unwrap(), None);
    }

    #[test]
    fn recovery_config_by_version() {
        let dir = camino_tempfile::tempdir().unwrap();
        let site: SiteConfig = toml::from_str(
            r#"
            prefix = "a/b/c"
            pg_data_directory = "/nonexistent"
            connection_string = ""

            [object_storage]
            kind = "local-fs"
            local_path = "/nonexistent"
        "#,
        )
        .unwrap();

        let modern = dir.path().join("pg15");
        std::fs::create_dir_all(&modern).unwrap();
        write_recovery_config(&site, &modern, 150004, false).unwrap();
        assert!(modern.join("recovery.signal").exists());
        let auto_conf = std::fs::read_to_string(modern.join("postgresql.auto.conf")).unwrap();
        assert!(auto_conf.contains("restore_command = 'pgvault_postgres_command"));

        let primary = dir.path().join("pg15-primary");
        std::fs::create_dir_all(&primary).unwrap();
        write_recovery_config(&site, &primary, 150004, true).unwrap();
        assert!(!primary.join("recovery.signal").exists());

        let legacy = dir.path().join("pg96");
        std::fs::create_dir_all(&legacy).unwrap();
        write_recovery_config(&site, &legacy, 90612, false).unwrap();
        let recovery_conf = std::fs::read_to_string(legacy.join("recovery.conf")).unwrap();
        assert!(recovery_conf.contains("standby_mode = 'on'"));
    }
}
