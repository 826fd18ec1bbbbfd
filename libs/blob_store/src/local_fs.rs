//! Local filesystem backend, keeping all the blobs in a directory tree
//! under the configured root. Used for tests, development, and NFS-style
//! backup targets.
//!
//! Per-blob metadata lives in a `<blob>.metadata` sidecar next to the blob
//! itself, written before the blob is renamed into place so a visible blob
//! always has its metadata readable.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    BlobStorage, BlobStream, Download, ListEntry, RemotePath, StorageError, StorageMetadata,
};

const METADATA_SUFFIX: &str = ".metadata";
const TEMP_SUFFIX: &str = ".temp";

#[derive(Debug, Clone)]
pub struct LocalFs {
    storage_root: Utf8PathBuf,
}

impl LocalFs {
    /// Creates the backend, ensuring the root directory exists.
    pub fn new(storage_root: Utf8PathBuf) -> anyhow::Result<Self> {
        if !storage_root.exists() {
            std::fs::create_dir_all(&storage_root)
                .with_context(|| format!("create root directory {storage_root:?}"))?;
        }
        Ok(Self { storage_root })
    }

    fn blob_path(&self, path: &RemotePath) -> Utf8PathBuf {
        self.storage_root.join(path.get_path())
    }

    fn relative_key(&self, full: &Utf8Path) -> anyhow::Result<RemotePath> {
        let rel = full
            .strip_prefix(&self.storage_root)
            .with_context(|| format!("path {full:?} escapes storage root"))?;
        RemotePath::new(rel)
    }

    async fn read_metadata(&self, blob: &Utf8Path) -> anyhow::Result<StorageMetadata> {
        let sidecar = sidecar_path(blob);
        match fs::read(&sidecar).await {
            Ok(bytes) => {
                let map: HashMap<String, String> = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parse metadata sidecar {sidecar:?}"))?;
                Ok(StorageMetadata(map))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StorageMetadata::new()),
            Err(e) => Err(e).with_context(|| format!("read metadata sidecar {sidecar:?}")),
        }
    }

    async fn entry_for(&self, full: Utf8PathBuf) -> Result<ListEntry, StorageError> {
        let attrs = fs::metadata(&full)
            .await
            .with_context(|| format!("stat blob {full:?}"))?;
        Ok(ListEntry {
            key: self.relative_key(&full)?,
            size: attrs.len(),
            metadata: self.read_metadata(&full).await?,
        })
    }
}

fn sidecar_path(blob: &Utf8Path) -> Utf8PathBuf {
    let mut s = blob.to_string();
    s.push_str(METADATA_SUFFIX);
    Utf8PathBuf::from(s)
}

fn is_auxiliary(name: &str) -> bool {
    name.ends_with(METADATA_SUFFIX) || name.ends_with(TEMP_SUFFIX)
}

#[async_trait]
impl BlobStorage for LocalFs {
    async fn put(
        &self,
        to: &RemotePath,
        mut from: BlobStream,
        size: usize,
        metadata: &StorageMetadata,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let target = self.blob_path(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directories for {target:?}"))?;
        }

        let temp_path = Utf8PathBuf::from(format!("{target}{TEMP_SUFFIX}"));
        let mut file = io::BufWriter::new(
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("open blob upload file {temp_path:?}"))?,
        );

        let bytes_written = io::copy(&mut from, &mut file)
            .await
            .with_context(|| format!("upload blob to file {temp_path:?}"))?;
        if bytes_written as usize != size {
            let cleanup = fs::remove_file(&temp_path).await;
            if let Err(e) = cleanup {
                tracing::warn!("failed to remove bad upload file {temp_path:?}: {e:#}");
            }
            return Err(StorageError::Other(anyhow::anyhow!(
                "upload to {target:?} got {bytes_written} bytes, expected {size}"
            )));
        }
        file.flush()
            .await
            .with_context(|| format!("flush blob file {temp_path:?}"))?;
        file.into_inner()
            .sync_all()
            .await
            .with_context(|| format!("sync blob file {temp_path:?}"))?;

        // Sidecar goes first: once the rename lands, the blob must be
        // observable together with its metadata.
        if !metadata.is_empty() {
            let sidecar = sidecar_path(&target);
            let encoded =
                serde_json::to_vec(&metadata.0).context("serialize blob metadata")?;
            fs::write(&sidecar, encoded)
                .await
                .with_context(|| format!("write metadata sidecar {sidecar:?}"))?;
        }

        fs::rename(&temp_path, &target)
            .await
            .with_context(|| format!("rename blob file to {target:?}"))?;

        Ok(())
    }

    async fn get(
        &self,
        from: &RemotePath,
        _cancel: &CancellationToken,
    ) -> Result<Download, StorageError> {
        let blob = self.blob_path(from);
        let file = match fs::File::open(&blob).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) => {
                return Err(StorageError::Other(
                    anyhow::Error::new(e).context(format!("open blob {blob:?}")),
                ))
            }
        };
        let size = file
            .metadata()
            .await
            .with_context(|| format!("stat blob {blob:?}"))?
            .len();
        let metadata = self.read_metadata(&blob).await?;
        Ok(Download {
            download_stream: Box::pin(io::BufReader::new(file)),
            size: Some(size),
            metadata,
        })
    }

    async fn list(
        &self,
        prefix: &RemotePath,
        deep: bool,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ListEntry>, StorageError> {
        let root = self.blob_path(prefix);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        if deep {
            // Directory walking is sync; hand it to the blocking pool.
            let root_clone = root.clone();
            let found = tokio::task::spawn_blocking(move || {
                let mut found = Vec::new();
                for dentry in walkdir::WalkDir::new(&root_clone).sort_by_file_name() {
                    let dentry = dentry.context("walk storage directory")?;
                    if dentry.file_type().is_file() {
                        let path = Utf8PathBuf::from_path_buf(dentry.into_path())
                            .map_err(|bad| anyhow::anyhow!("non-utf8 blob path {bad:?}"))?;
                        found.push(path);
                    }
                }
                Ok::<_, anyhow::Error>(found)
            })
            .await
            .context("blob listing task panicked")??;
            files.extend(found);
        } else {
            let mut dir = fs::read_dir(&root)
                .await
                .with_context(|| format!("list directory {root:?}"))?;
            while let Some(dentry) = dir
                .next_entry()
                .await
                .with_context(|| format!("read directory entry in {root:?}"))?
            {
                if dentry
                    .file_type()
                    .await
                    .with_context(|| format!("stat directory entry in {root:?}"))?
                    .is_file()
                {
                    let path = Utf8PathBuf::from_path_buf(dentry.path())
                        .map_err(|bad| anyhow::anyhow!("non-utf8 blob path {bad:?}"))?;
                    files.push(path);
                }
            }
            files.sort();
        }

        let mut entries = Vec::with_capacity(files.len());
        for full in files {
            let name = full.file_name().unwrap_or_default();
            if is_auxiliary(name) {
                continue;
            }
            entries.push(self.entry_for(full).await?);
        }
        Ok(entries)
    }

    async fn delete(
        &self,
        path: &RemotePath,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let blob = self.blob_path(path);
        match fs::remove_file(&blob).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) => {
                return Err(StorageError::Other(
                    anyhow::Error::new(e).context(format!("delete blob {blob:?}")),
                ))
            }
        }
        match fs::remove_file(sidecar_path(&blob)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Other(
                anyhow::Error::new(e).context(format!("delete metadata sidecar of {blob:?}")),
            )),
        }
    }

    async fn get_metadata(
        &self,
        path: &RemotePath,
        _cancel: &CancellationToken,
    ) -> Result<StorageMetadata, StorageError> {
        let blob = self.blob_path(path);
        match fs::metadata(&blob).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(e) => {
                return Err(StorageError::Other(
                    anyhow::Error::new(e).context(format!("stat blob {blob:?}")),
                ))
            }
        }
        Ok(self.read_metadata(&blob).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GenericBlobStorage;
    use bytes::Bytes;

    fn storage() -> (camino_tempfile::Utf8TempDir, GenericBlobStorage) {
        let dir = camino_tempfile::tempdir().unwrap();
        let storage =
            GenericBlobStorage::LocalFs(LocalFs::new(dir.path().to_path_buf()).unwrap());
        (dir, storage)
    }

    #[tokio::test]
    async fn put_get_round_trip_with_metadata() {
        let (_dir, storage) = storage();
        let cancel = CancellationToken::new();
        let key = RemotePath::from_string("site/basebackup/2024-01-01_0").unwrap();
        let metadata = StorageMetadata::from([("start-time", "2024-01-01T00:00:00+00:00")]);

        storage
            .put_bytes(&key, Bytes::from_static(b"manifest bytes"), &metadata, &cancel)
            .await
            .unwrap();

        let (bytes, got_metadata) = storage.get_bytes(&key, &cancel).await.unwrap();
        assert_eq!(&bytes[..], b"manifest bytes");
        assert_eq!(got_metadata, metadata);
        assert_eq!(
            storage.get_metadata(&key, &cancel).await.unwrap(),
            metadata
        );
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (_dir, storage) = storage();
        let cancel = CancellationToken::new();
        let key = RemotePath::from_string("site/basebackup/nope").unwrap();

        assert!(matches!(
            storage.get(&key, &cancel).await,
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            storage.delete(&key, &cancel).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_shallow_and_deep() {
        let (_dir, storage) = storage();
        let cancel = CancellationToken::new();
        let meta = StorageMetadata::new();

        for key in [
            "site/basebackup/b1",
            "site/basebackup/b2",
            "site/basebackup_chunk/b1/0000",
            "site/basebackup_chunk/b1/0001",
        ] {
            storage
                .put_bytes(
                    &RemotePath::from_string(key).unwrap(),
                    Bytes::from_static(b"x"),
                    &meta,
                    &cancel,
                )
                .await
                .unwrap();
        }

        let prefix = RemotePath::from_string("site/basebackup").unwrap();
        let shallow = storage.list(&prefix, false, &cancel).await.unwrap();
        assert_eq!(
            shallow
                .iter()
                .map(|e| e.key.to_string())
                .collect::<Vec<_>>(),
            vec!["site/basebackup/b1", "site/basebackup/b2"]
        );

        let prefix = RemotePath::from_string("site/basebackup_chunk").unwrap();
        assert_eq!(storage.list(&prefix, false, &cancel).await.unwrap().len(), 0);
        let deep = storage.list(&prefix, true, &cancel).await.unwrap();
        assert_eq!(
            deep.iter().map(|e| e.key.to_string()).collect::<Vec<_>>(),
            vec![
                "site/basebackup_chunk/b1/0000",
                "site/basebackup_chunk/b1/0001"
            ]
        );

        let missing = RemotePath::from_string("site/preservation_request").unwrap();
        assert!(storage.list(&missing, false, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_to_stream_reports_progress() {
        let (_dir, storage) = storage();
        let cancel = CancellationToken::new();
        let key = RemotePath::from_string("site/basebackup/b1").unwrap();
        let payload = vec![b'x'; 200_000];
        storage
            .put_bytes(&key, Bytes::from(payload.clone()), &StorageMetadata::new(), &cancel)
            .await
            .unwrap();

        let mut sink = std::io::Cursor::new(Vec::new());
        let mut seen = Vec::new();
        let mut progress = |copied: u64| seen.push(copied);
        let (total, _metadata) = storage
            .get_to_stream(&key, &mut sink, Some(&mut progress), &cancel)
            .await
            .unwrap();

        assert_eq!(total, payload.len() as u64);
        assert_eq!(sink.into_inner(), payload);
        assert_eq!(seen.last().copied(), Some(payload.len() as u64));
        assert!(seen.len() > 1, "progress should tick more than once");
    }

    #[tokio::test]
    async fn sidecars_are_invisible_to_listing() {
        let (_dir, storage) = storage();
        let cancel = CancellationToken::new();
        let key = RemotePath::from_string("site/basebackup/b1").unwrap();
        let metadata = StorageMetadata::from([("format", "v2")]);
        storage
            .put_bytes(&key, Bytes::from_static(b"x"), &metadata, &cancel)
            .await
            .unwrap();

        let prefix = RemotePath::from_string("site/basebackup").unwrap();
        let listed = storage.list(&prefix, false, &cancel).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata, metadata);
        assert_eq!(listed[0].size, 1);
    }
}
