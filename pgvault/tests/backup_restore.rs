//! End-to-end exercises of the executor and the restore engine against a
//! fake PostgreSQL and a local blob store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use blob_store::{GenericBlobStorage, LocalFs};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pgvault::basebackup::{BackupError, BasebackupJob, BasebackupMode, CallbackEvent};
use pgvault::config::{ActiveBackupMode, SiteConfig};
use pgvault::listing::{self, meta_keys};
use pgvault::pg::{PgTablespace, PostgresApi, StoppedBackup};
use pgvault::restore::{restore_basebackup, DownloadProgress, RestoreOptions};
use pgvault::scheduler::{BackupReason, BackupStub};

const BACKUP_LABEL: &str = "START WAL LOCATION: 0/4000028 (file 000000010000000000000004)\n\
                            CHECKPOINT LOCATION: 0/4000060\n\
                            BACKUP METHOD: streamed\n\
                            BACKUP FROM: master\n\
                            START TIME: 2015-02-12 14:07:19 GMT\n\
                            LABEL: pgvault_base_backup\n";

struct FakePg {
    alive: AtomicBool,
    stop_fails: bool,
    tablespaces: Vec<PgTablespace>,
}

impl FakePg {
    fn new() -> Self {
        FakePg {
            alive: AtomicBool::new(true),
            stop_fails: false,
            tablespaces: Vec::new(),
        }
    }

    fn dead() -> Self {
        let pg = Self::new();
        pg.alive.store(false, Ordering::SeqCst);
        pg
    }
}

#[async_trait]
impl PostgresApi for FakePg {
    async fn check_connection_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn server_version_num(&self) -> anyhow::Result<u32> {
        Ok(150004)
    }

    async fn is_in_recovery(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn list_tablespaces(&self) -> anyhow::Result<Vec<PgTablespace>> {
        Ok(self.tablespaces.clone())
    }

    async fn start_backup(&self, _label: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop_backup(&self) -> anyhow::Result<StoppedBackup> {
        if self.stop_fails {
            anyhow::bail!("simulated failure closing the backup barrier");
        }
        Ok(StoppedBackup {
            backup_label: BACKUP_LABEL.to_string(),
            end_lsn: "0/5000060".to_string(),
            end_wal_segment: Some("000000010000000000000005".to_string()),
            end_time: Utc::now(),
        })
    }
}

struct Harness {
    dir: camino_tempfile::Utf8TempDir,
    site: SiteConfig,
    storage: GenericBlobStorage,
    pgdata: Utf8PathBuf,
}

fn write_file(path: &Utf8Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn harness(mode: &str) -> Harness {
    let dir = camino_tempfile::tempdir().unwrap();
    let pgdata = dir.path().join("pgdata");
    let store = dir.path().join("store");

    write_file(&pgdata.join("PG_VERSION"), b"15\n");
    write_file(&pgdata.join("postgresql.conf"), b"shared_buffers = '128MB'\n");
    write_file(&pgdata.join("global/pg_control"), &[7u8; 512]);
    write_file(&pgdata.join("base/1/2654"), &vec![b'a'; 3000]);
    write_file(&pgdata.join("base/1/2655"), &vec![b'b'; 2000]);
    write_file(&pgdata.join("base/16384/1259"), &vec![b'c'; 1500]);
    std::fs::create_dir_all(pgdata.join("pg_wal")).unwrap();

    let mut site: SiteConfig = toml::from_str(&format!(
        r#"
        prefix = "prod/main"
        pg_data_directory = "{pgdata}"
        connection_string = "host=localhost"
        basebackup_mode = "{mode}"

        [object_storage]
        kind = "local-fs"
        local_path = "{store}"
    "#
    ))
    .unwrap();
    site.basebackup_parallel_jobs = 2;

    let storage = GenericBlobStorage::LocalFs(LocalFs::new(store).unwrap());
    Harness {
        dir,
        site,
        storage,
        pgdata,
    }
}

/// Where the start WAL segment named by [`BACKUP_LABEL`] lives in the
/// fixture cluster.
fn pgdata_wal_segment(harness: &Harness) -> Utf8PathBuf {
    harness.pgdata.join("pg_wal/000000010000000000000004")
}

impl Harness {
    async fn run_backup(&self, pg: Arc<dyn PostgresApi>) -> CallbackEvent {
        let stub = BackupStub {
            reason: BackupReason::Scheduled,
            decision_time: Utc::now(),
            normalized_backup_time: None,
        };
        let (callback_tx, mut callback_rx) = mpsc::channel(1);
        BasebackupJob::new(
            "testsite",
            self.site.clone(),
            self.storage.clone(),
            pg,
            stub,
            self.dir.path().join("scratch"),
            CancellationToken::new(),
        )
        .run_safe(callback_tx)
        .await;
        callback_rx.recv().await.expect("executor always reports")
    }

    async fn backup_names(&self) -> Vec<String> {
        let cancel = CancellationToken::new();
        listing::list_site_basebackups(&self.storage, &self.site, &cancel)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    async fn count(&self, prefix: &blob_store::RemotePath, deep: bool) -> usize {
        self.storage
            .list(prefix, deep, &CancellationToken::new())
            .await
            .unwrap()
            .len()
    }
}

/// Every file under `original` must exist under `restored` with identical
/// contents.
fn assert_tree_restored(original: &Utf8Path, restored: &Utf8Path) {
    for dentry in walkdir::WalkDir::new(original.as_std_path()).min_depth(1) {
        let dentry = dentry.unwrap();
        if !dentry.file_type().is_file() {
            continue;
        }
        let rel = dentry.path().strip_prefix(original.as_std_path()).unwrap();
        let restored_path = restored.as_std_path().join(rel);
        let original_bytes = std::fs::read(dentry.path()).unwrap();
        let restored_bytes = std::fs::read(&restored_path)
            .unwrap_or_else(|e| panic!("missing restored file {restored_path:?}: {e}"));
        assert_eq!(
            original_bytes, restored_bytes,
            "contents differ for {rel:?}"
        );
    }
}

#[tokio::test]
async fn local_tar_backup_and_restore_round_trip() {
    let harness = harness("local-tar");
    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    let CallbackEvent::Success { backup_name, mode } = event else {
        panic!("backup failed: {event:?}");
    };
    assert_eq!(mode, BasebackupMode::LocalTar);

    // entry metadata carries the label-derived fields
    let cancel = CancellationToken::new();
    let entries = listing::list_site_basebackups(&harness.storage, &harness.site, &cancel)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.name, backup_name);
    assert_eq!(
        entry.metadata[meta_keys::START_WAL_SEGMENT],
        "000000010000000000000004"
    );
    assert_eq!(
        entry.metadata[meta_keys::START_TIME],
        "2015-02-12T14:07:19+00:00"
    );
    assert_eq!(
        entry.metadata[meta_keys::END_WAL_SEGMENT],
        "000000010000000000000005"
    );
    assert!(entry.metadata.contains_key(meta_keys::END_TIME));
    assert_eq!(entry.metadata[meta_keys::FORMAT], "v2");
    assert_eq!(entry.metadata[meta_keys::BASEBACKUP_MODE], "local-tar");

    let target = harness.dir.path().join("restore");
    let options = RestoreOptions::new(target.clone());
    let restored = restore_basebackup(&harness.storage, &harness.site, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(restored, backup_name);

    assert_tree_restored(&harness.pgdata, &target);
    assert_eq!(
        std::fs::read_to_string(target.join("backup_label")).unwrap(),
        BACKUP_LABEL
    );
    assert!(target.join("recovery.signal").exists());
    assert!(target.join("pg_wal").is_dir());

    // restoring again without --overwrite refuses
    let err = restore_basebackup(&harness.storage, &harness.site, &options, &cancel)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not empty"));
    assert!(err.to_string().contains("--overwrite not specified"));

    let mut overwrite = options.clone();
    overwrite.overwrite = true;
    restore_basebackup(&harness.storage, &harness.site, &overwrite, &cancel)
        .await
        .unwrap();
    assert_tree_restored(&harness.pgdata, &target);
}

#[tokio::test]
async fn chunked_backup_splits_by_chunk_size() {
    let mut harness = harness("local-tar");
    harness.site.basebackup_chunk_size = 2_500;

    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    let CallbackEvent::Success { backup_name, .. } = event else {
        panic!("backup failed: {event:?}");
    };

    let chunk_count = harness
        .count(
            &harness.site.chunk_prefix(false).join(&backup_name),
            false,
        )
        .await;
    assert!(chunk_count > 1, "expected multiple chunks, got {chunk_count}");

    // chunked restore still reassembles the tree
    let cancel = CancellationToken::new();
    let target = harness.dir.path().join("restore");
    restore_basebackup(
        &harness.storage,
        &harness.site,
        &RestoreOptions::new(target.clone()),
        &cancel,
    )
    .await
    .unwrap();
    assert_tree_restored(&harness.pgdata, &target);
}

#[tokio::test]
async fn delta_backup_uploads_then_reuses() {
    let mut harness = harness("delta");
    harness.site.basebackup_delta_mode_min_delta_file_size = 1024;

    let first = harness.run_backup(Arc::new(FakePg::new())).await;
    assert!(first.success(), "first delta backup failed: {first:?}");
    let delta_blobs = harness.count(&harness.site.delta_prefix(), false).await;
    // the three relation files sit above the 1024-byte floor
    assert_eq!(delta_blobs, 3);

    // identical cluster: the second backup references, never uploads
    let second = harness.run_backup(Arc::new(FakePg::new())).await;
    let CallbackEvent::Success { backup_name, .. } = second else {
        panic!("second delta backup failed: {second:?}");
    };
    assert_eq!(
        harness.count(&harness.site.delta_prefix(), false).await,
        delta_blobs,
        "a delta backup over unchanged files must upload no new blobs"
    );

    let cancel = CancellationToken::new();
    let manifest =
        listing::fetch_backup_manifest(&harness.storage, &harness.site, &backup_name, &cancel)
            .await
            .unwrap();
    assert_eq!(manifest.delta_files.len(), 3);
    let stats = manifest.delta_stats.expect("delta manifests carry stats");
    assert_eq!(stats.hashes.len(), 3);

    // and the delta restore reassembles the full tree
    let target = harness.dir.path().join("restore");
    restore_basebackup(
        &harness.storage,
        &harness.site,
        &RestoreOptions::new(target.clone()),
        &cancel,
    )
    .await
    .unwrap();
    assert_tree_restored(&harness.pgdata, &target);
}

#[tokio::test]
async fn delta_parameters_drive_blob_and_chunk_counts() {
    // (min_delta_file_size, expected delta files)
    for (min_size, expected_delta_files) in [(1024, 3), (2_500, 1), (1 << 20, 0)] {
        let mut harness = harness("delta");
        harness.site.basebackup_delta_mode_min_delta_file_size = min_size;

        let event = harness.run_backup(Arc::new(FakePg::new())).await;
        assert!(event.success(), "delta backup failed: {event:?}");
        assert_eq!(
            harness.count(&harness.site.delta_prefix(), false).await,
            expected_delta_files,
            "min_delta_file_size = {min_size}"
        );
        assert_eq!(
            harness.count(&harness.site.chunk_prefix(true), true).await,
            1,
            "small files collapse into one delta chunk"
        );
    }

    // a small delta chunk size splits the inlined remainder
    let mut harness = harness("delta");
    harness.site.basebackup_delta_mode_min_delta_file_size = 1 << 20;
    harness.site.basebackup_delta_mode_chunk_size = 2_500;
    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    assert!(event.success(), "delta backup failed: {event:?}");
    assert_eq!(harness.count(&harness.site.delta_prefix(), false).await, 0);
    assert!(harness.count(&harness.site.chunk_prefix(true), true).await > 1);
}

#[tokio::test]
async fn local_tar_delta_stats_feeds_later_delta_backups() {
    let mut harness = harness("local-tar-delta-stats");
    harness.site.basebackup_delta_mode_min_delta_file_size = 1024;

    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    let CallbackEvent::Success { backup_name, .. } = event else {
        panic!("backup failed: {event:?}");
    };

    let cancel = CancellationToken::new();
    let manifest =
        listing::fetch_backup_manifest(&harness.storage, &harness.site, &backup_name, &cancel)
            .await
            .unwrap();
    // v2 format, but with the hashes recorded for future delta runs
    assert_eq!(manifest.format, pgvault::manifest::BackupFormat::V2);
    assert_eq!(
        manifest.delta_stats.as_ref().map(|s| s.hashes.len()),
        Some(3)
    );

    // a delta backup over the unchanged cluster uploads nothing
    harness.site.basebackup_mode = "delta".to_string();
    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    assert!(event.success(), "delta backup failed: {event:?}");
    assert_eq!(harness.count(&harness.site.delta_prefix(), false).await, 0);
}

#[tokio::test]
async fn lost_connection_fails_with_the_exact_cause() {
    for mode in ["local-tar", "delta", "local-tar-delta-stats"] {
        let harness = harness(mode);
        let event = harness.run_backup(Arc::new(FakePg::dead())).await;
        let CallbackEvent::Failure { error, .. } = event else {
            panic!("{mode}: expected failure, got {event:?}");
        };
        assert!(matches!(error, BackupError::ConnectionLost), "{mode}: {error:?}");
        assert_eq!(
            error.to_string(),
            "PostgreSQL connection was lost during backup process."
        );
        assert!(harness.backup_names().await.is_empty());
    }
}

#[tokio::test]
async fn unsupported_mode_fails_through_the_callback_channel() {
    let harness = harness("non-existing");
    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    let CallbackEvent::Failure { mode, error } = event else {
        panic!("expected failure, got {event:?}");
    };
    assert_eq!(mode, None);
    assert!(matches!(error, BackupError::UnsupportedMode(_)), "{error:?}");
}

#[tokio::test]
async fn standalone_hot_backup_materializes_start_wal_segment() {
    for mode in ["local-tar", "delta"] {
        let mut harness = harness(mode);
        harness.site.active_backup_mode = ActiveBackupMode::StandaloneHotBackup;
        // the segment named by BACKUP_LABEL's START WAL LOCATION line
        let segment = pgdata_wal_segment(&harness);
        write_file(&segment, &vec![b'w'; 8192]);

        let event = harness.run_backup(Arc::new(FakePg::new())).await;
        let CallbackEvent::Success { backup_name, .. } = event else {
            panic!("{mode}: backup failed: {event:?}");
        };

        // the segment travels as an extra chunk past what the walker emits
        let cancel = CancellationToken::new();
        let manifest =
            listing::fetch_backup_manifest(&harness.storage, &harness.site, &backup_name, &cancel)
                .await
                .unwrap();
        assert!(
            manifest.chunks.len() >= 2,
            "{mode}: expected a dedicated wal chunk, got {} chunk(s)",
            manifest.chunks.len()
        );

        let target = harness.dir.path().join("restore");
        restore_basebackup(
            &harness.storage,
            &harness.site,
            &RestoreOptions::new(target.clone()),
            &cancel,
        )
        .await
        .unwrap();

        let restored_segment = target.join("pg_wal/000000010000000000000004");
        assert_eq!(
            std::fs::read(&restored_segment).unwrap_or_else(|e| panic!(
                "{mode}: start wal segment not materialized at {restored_segment}: {e}"
            )),
            vec![b'w'; 8192]
        );
        assert_tree_restored(&harness.pgdata, &target);
    }
}

#[tokio::test]
async fn archive_command_backups_leave_wal_to_the_archive() {
    let harness = harness("local-tar");
    write_file(&pgdata_wal_segment(&harness), &vec![b'w'; 8192]);

    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    assert!(event.success(), "backup failed: {event:?}");

    let cancel = CancellationToken::new();
    let target = harness.dir.path().join("restore");
    restore_basebackup(
        &harness.storage,
        &harness.site,
        &RestoreOptions::new(target.clone()),
        &cancel,
    )
    .await
    .unwrap();

    // WAL comes back through the separate archive, not the basebackup
    assert!(target.join("pg_wal").is_dir());
    assert!(!target.join("pg_wal/000000010000000000000004").exists());
}

#[tokio::test]
async fn tampered_chunk_is_rejected_on_restore() {
    let harness = harness("local-tar");
    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    let CallbackEvent::Success { backup_name, .. } = event else {
        panic!("backup failed: {event:?}");
    };

    // flip the stored bytes of the first chunk behind the gateway's back
    let cancel = CancellationToken::new();
    let chunks = harness
        .storage
        .list(
            &harness.site.chunk_prefix(false).join(&backup_name),
            false,
            &cancel,
        )
        .await
        .unwrap();
    let chunk_on_disk = harness
        .dir
        .path()
        .join("store")
        .join(chunks[0].key.get_path());
    std::fs::write(&chunk_on_disk, b"not the bytes that were uploaded").unwrap();

    let target = harness.dir.path().join("restore");
    let err = restore_basebackup(
        &harness.storage,
        &harness.site,
        &RestoreOptions::new(target),
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(
        err.to_string().contains("digest mismatch"),
        "unexpected error: {err:#}"
    );
}

#[tokio::test]
async fn restore_reports_download_progress() {
    let harness = harness("local-tar");
    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    assert!(event.success(), "backup failed: {event:?}");

    let cancel = CancellationToken::new();
    let progress = Arc::new(DownloadProgress::default());
    let mut options = RestoreOptions::new(harness.dir.path().join("restore"));
    options.progress = Some(Arc::clone(&progress));
    restore_basebackup(&harness.storage, &harness.site, &options, &cancel)
        .await
        .unwrap();

    let total = progress.total_blobs.load(Ordering::SeqCst);
    assert!(total >= 1);
    assert_eq!(progress.completed_blobs.load(Ordering::SeqCst), total);
    assert!(progress.downloaded_bytes.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn failed_backup_leaves_orphan_chunks_but_no_entry() {
    let harness = harness("local-tar");
    let mut pg = FakePg::new();
    pg.stop_fails = true;

    let event = harness.run_backup(Arc::new(pg)).await;
    assert!(!event.success(), "expected failure, got {event:?}");

    // no manifest key: the backup does not exist for readers
    assert!(harness.backup_names().await.is_empty());
    // but the already uploaded chunks linger as orphans
    assert!(harness.count(&harness.site.chunk_prefix(false), true).await >= 1);
}

#[tokio::test]
async fn tablespaces_restore_through_mappings() {
    let mut harness = harness("local-tar");
    let ts_src = harness.dir.path().join("ts-src");
    write_file(&ts_src.join("PG_15_202209061/16384/4242"), &vec![b't'; 2000]);

    let mut pg = FakePg::new();
    pg.tablespaces = vec![PgTablespace {
        name: "tstest".to_string(),
        oid: 16385,
        path: ts_src.to_string(),
    }];
    let event = harness.run_backup(Arc::new(pg)).await;
    assert!(event.success(), "backup failed: {event:?}");

    let cancel = CancellationToken::new();
    let target = harness.dir.path().join("restore");

    // mapping for a tablespace the backup does not contain
    let mut options = RestoreOptions::new(target.clone());
    options.tablespace_mapping =
        HashMap::from([("other".to_string(), harness.dir.path().join("other"))]);
    let err = restore_basebackup(&harness.storage, &harness.site, &options, &cancel)
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("Tablespace mapping for [\"other\"] was requested, but"));

    // the original path is still occupied, so an explicit mapping is needed
    let ts_target = harness.dir.path().join("ts-restored");
    std::fs::create_dir_all(&ts_target).unwrap();
    let mut options = RestoreOptions::new(target.clone());
    options.tablespace_mapping = HashMap::from([("tstest".to_string(), ts_target.clone())]);
    restore_basebackup(&harness.storage, &harness.site, &options, &cancel)
        .await
        .unwrap();

    assert_tree_restored(&harness.pgdata, &target);
    assert_tree_restored(&ts_src, &ts_target);
    let link = target.join("pg_tblspc/16385");
    assert_eq!(
        std::fs::read_link(&link).unwrap(),
        ts_target.as_std_path()
    );
}

#[tokio::test]
async fn encrypted_backups_restore_with_the_secret_half() {
    use age::secrecy::ExposeSecret;

    let mut harness = harness("local-tar");
    let identity = age::x25519::Identity::generate();
    harness.site.encryption_key_id = Some("testkey".to_string());
    harness.site.encryption_keys = HashMap::from([(
        "testkey".to_string(),
        pgvault::config::EncryptionKey {
            public: Some(identity.to_public().to_string()),
            private: Some(identity.to_string().expose_secret().to_string()),
        },
    )]);

    let event = harness.run_backup(Arc::new(FakePg::new())).await;
    let CallbackEvent::Success { backup_name, .. } = event else {
        panic!("backup failed: {event:?}");
    };

    // chunks on disk are sealed age streams, not naked zstd
    let cancel = CancellationToken::new();
    let chunks = harness
        .storage
        .list(
            &harness.site.chunk_prefix(false).join(&backup_name),
            false,
            &cancel,
        )
        .await
        .unwrap();
    assert!(!chunks.is_empty());
    let (chunk_bytes, chunk_metadata) = harness
        .storage
        .get_bytes(&chunks[0].key, &cancel)
        .await
        .unwrap();
    assert!(chunk_bytes.starts_with(b"age-encryption.org/"));
    assert_eq!(chunk_metadata.get("encryption-key-id"), Some("testkey"));

    let target = harness.dir.path().join("restore");
    restore_basebackup(
        &harness.storage,
        &harness.site,
        &RestoreOptions::new(target.clone()),
        &cancel,
    )
    .await
    .unwrap();
    assert_tree_restored(&harness.pgdata, &target);
}
