//! Preservation requests: marker blobs that forbid retention from
//! deleting a backup until a deadline.
//!
//! The markers are advisory from the agent's point of view. The `try_*`
//! variants exist for the restore path, where a failure to preserve (or to
//! cancel a preservation afterwards) must not fail the restore itself; the
//! storage drivers do not classify their errors, so anything can surface
//! here and gets logged verbatim instead of propagated.

use blob_store::{GenericBlobStorage, StorageError, StorageMetadata};
use chrono::{DateTime, FixedOffset};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::SiteConfig;

pub const PRESERVE_BACKUP_META: &str = "preserve-backup";
pub const PRESERVE_UNTIL_META: &str = "preserve-until";

/// `2022-12-18 10:20:30.123456+00:00`; fractional seconds only when
/// present. Existing markers use this exact spelling, so it is part of the
/// key format.
fn format_preserve_until(preserve_until: &DateTime<FixedOffset>) -> String {
    preserve_until.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string()
}

/// Writes the marker forbidding deletion of `backup_name` until
/// `preserve_until`; returns the request name to cancel with later.
pub async fn request_backup_preservation(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    backup_name: &str,
    preserve_until: &DateTime<FixedOffset>,
    cancel: &CancellationToken,
) -> Result<String, StorageError> {
    let until = format_preserve_until(preserve_until);
    let request_name = format!("{backup_name}_{until}");
    let key = site.preservation_prefix().join(&request_name);
    let metadata = StorageMetadata(
        [
            (PRESERVE_BACKUP_META.to_string(), backup_name.to_string()),
            (PRESERVE_UNTIL_META.to_string(), until),
        ]
        .into_iter()
        .collect(),
    );
    storage.put_empty(&key, &metadata, cancel).await?;
    Ok(request_name)
}

/// Deletes the marker; cancelling an already-removed request succeeds.
pub async fn cancel_backup_preservation(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    request_name: &str,
    cancel: &CancellationToken,
) -> Result<(), StorageError> {
    let key = site.preservation_prefix().join(request_name);
    match storage.delete(&key, cancel).await {
        Ok(()) | Err(StorageError::NotFound) => Ok(()),
        Err(e) => Err(e),
    }
}

pub async fn try_request_backup_preservation(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    backup_name: &str,
    preserve_until: &DateTime<FixedOffset>,
    cancel: &CancellationToken,
) -> Option<String> {
    match request_backup_preservation(storage, site, backup_name, preserve_until, cancel).await
    {
        Ok(request_name) => Some(request_name),
        Err(e) => {
            warn!("could not request backup preservation: {e:#}");
            None
        }
    }
}

pub async fn try_cancel_backup_preservation(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    request_name: &str,
    cancel: &CancellationToken,
) {
    if let Err(e) = cancel_backup_preservation(storage, site, request_name, cancel).await {
        warn!("could not cancel backup preservation: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blob_store::{LocalFs, RemotePath};

    fn fixture() -> (camino_tempfile::Utf8TempDir, GenericBlobStorage, SiteConfig) {
        let dir = camino_tempfile::tempdir().unwrap();
        let storage =
            GenericBlobStorage::LocalFs(LocalFs::new(dir.path().to_path_buf()).unwrap());
        let site: SiteConfig = toml::from_str(
            r#"
            prefix = "site_name"
            pg_data_directory = "/nonexistent"
            connection_string = ""

            [object_storage]
            kind = "local-fs"
            local_path = "/nonexistent"
        "#,
        )
        .unwrap();
        (dir, storage, site)
    }

    #[tokio::test]
    async fn request_and_cancel_round_trip() {
        let (_dir, storage, site) = fixture();
        let cancel = CancellationToken::new();
        let preserve_until: DateTime<FixedOffset> =
            "2022-12-18T10:20:30.123456+00:00".parse().unwrap();

        let request_name = request_backup_preservation(
            &storage,
            &site,
            "2022_12_10",
            &preserve_until,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(
            request_name,
            "2022_12_10_2022-12-18 10:20:30.123456+00:00"
        );

        let key = RemotePath::from_string(&format!(
            "site_name/preservation_request/{request_name}"
        ))
        .unwrap();
        let metadata = storage.get_metadata(&key, &cancel).await.unwrap();
        assert_eq!(metadata.get(PRESERVE_BACKUP_META), Some("2022_12_10"));
        assert_eq!(
            metadata.get(PRESERVE_UNTIL_META),
            Some("2022-12-18 10:20:30.123456+00:00")
        );
        // the marker itself carries no payload
        let (bytes, _) = storage.get_bytes(&key, &cancel).await.unwrap();
        assert!(bytes.is_empty());

        cancel_backup_preservation(&storage, &site, &request_name, &cancel)
            .await
            .unwrap();
        assert!(matches!(
            storage.get_metadata(&key, &cancel).await,
            Err(StorageError::NotFound)
        ));

        // cancelling again is fine
        cancel_backup_preservation(&storage, &site, &request_name, &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn whole_second_deadlines_have_no_fraction() {
        let preserve_until: DateTime<FixedOffset> =
            "2022-12-18T10:20:30+00:00".parse().unwrap();
        assert_eq!(
            format_preserve_until(&preserve_until),
            "2022-12-18 10:20:30+00:00"
        );
    }
}
