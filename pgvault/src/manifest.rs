//! The durable description of one base backup, and backup-label parsing.
//!
//! The manifest blob is the serialization point of a backup: readers either
//! see a complete backup (manifest present, every referenced blob already
//! durable) or nothing. Its byte layout is stable per format version:
//! a 4-byte magic, one version byte, the u32-LE length of the compressed
//! payload, then the zstd-compressed JSON document.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use bytes::Bytes;
use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_stream::StreamExt;

pub const MANIFEST_MAGIC: &[u8; 4] = b"PGVM";
pub const MANIFEST_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupFormat {
    /// Whole archive stored as a single blob under the basebackup key.
    #[serde(rename = "v1")]
    V1,
    /// Chunked archive with a manifest blob.
    #[serde(rename = "v2")]
    V2,
    #[serde(rename = "delta-v1")]
    DeltaV1,
    /// Chunked small files plus content-addressed delta blobs.
    #[serde(rename = "delta-v2")]
    DeltaV2,
}

impl BackupFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupFormat::V1 => "v1",
            BackupFormat::V2 => "v2",
            BackupFormat::DeltaV1 => "delta-v1",
            BackupFormat::DeltaV2 => "delta-v2",
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, BackupFormat::DeltaV1 | BackupFormat::DeltaV2)
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(BackupFormat::V1),
            "v2" => Ok(BackupFormat::V2),
            "delta-v1" => Ok(BackupFormat::DeltaV1),
            "delta-v2" => Ok(BackupFormat::DeltaV2),
            other => anyhow::bail!("unknown backup format {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Key leaf under `basebackup_chunk/<name>/` (or the delta chunk prefix).
    pub chunk_filename: String,
    /// Bytes fed into the tar stream.
    pub input_size: u64,
    /// Bytes stored after compression and encryption.
    pub result_size: u64,
    pub file_count: u64,
    /// SHA-256 of the stored blob bytes, verified on download.
    pub digest: String,
}

/// Content hashes recorded by this backup: hex digest of the plain file
/// contents mapped to the plain content length. Future delta backups merge
/// these maps to decide which files they can skip uploading.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaStats {
    pub hashes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaFileEntry {
    /// Archive-relative path, e.g. `pgdata/base/16384/2654`.
    pub relative_path: String,
    pub file_size: u64,
    pub hexdigest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablespaceInfo {
    pub oid: u32,
    /// Absolute path the tablespace lived at on the backed-up host.
    pub path: String,
    /// Symlink location inside the data directory, `pg_tblspc/<oid>`.
    pub oid_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format: BackupFormat,
    /// `server_version_num` of the backed-up cluster, e.g. "150004".
    pub pg_version: String,
    /// Verbatim backup_label text returned by the snapshot protocol.
    pub backup_label: String,
    pub chunks: Vec<ChunkInfo>,
    #[serde(default)]
    pub delta_files: Vec<DeltaFileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_stats: Option<DeltaStats>,
    #[serde(default)]
    pub tablespaces: BTreeMap<String, TablespaceInfo>,
}

impl BackupManifest {
    pub async fn to_bytes(&self) -> anyhow::Result<Bytes> {
        let json = serde_json::to_vec(self).context("serialize backup manifest")?;

        let mut encoder = ZstdEncoder::new(std::io::Cursor::new(Vec::new()));
        encoder
            .write_all(&json)
            .await
            .context("compress backup manifest")?;
        encoder.shutdown().await.context("compress backup manifest")?;
        let compressed = encoder.into_inner().into_inner();

        let mut out = Vec::with_capacity(MANIFEST_MAGIC.len() + 5 + compressed.len());
        out.extend_from_slice(MANIFEST_MAGIC);
        out.push(MANIFEST_VERSION);
        out.extend_from_slice(
            &u32::try_from(compressed.len())
                .context("manifest payload over 4 GiB")?
                .to_le_bytes(),
        );
        out.extend_from_slice(&compressed);
        Ok(Bytes::from(out))
    }

    pub async fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            bytes.len() > MANIFEST_MAGIC.len() + 5,
            "manifest blob too short ({} bytes)",
            bytes.len()
        );
        let (magic, rest) = bytes.split_at(MANIFEST_MAGIC.len());
        anyhow::ensure!(magic == MANIFEST_MAGIC, "bad manifest magic {magic:?}");
        let (version, rest) = rest.split_first().expect("length checked above");
        anyhow::ensure!(
            *version == MANIFEST_VERSION,
            "unsupported manifest version {version}"
        );
        let (len_bytes, payload) = rest.split_at(4);
        let expected_len = u32::from_le_bytes(len_bytes.try_into().expect("4 bytes")) as usize;
        anyhow::ensure!(
            payload.len() == expected_len,
            "manifest payload length {} does not match header {expected_len}",
            payload.len()
        );

        let mut decoder = ZstdDecoder::new(payload);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .await
            .context("decompress backup manifest")?;
        serde_json::from_slice(&json).context("parse backup manifest")
    }
}

static START_WAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"START WAL LOCATION: [0-9A-Fa-f/]+ \(file ([0-9A-Fa-f]+)\)")
        .expect("valid regex")
});
static START_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"START TIME: (.+)").expect("valid regex"));

/// Extracts `(start_wal_segment, start_time)` from a textual backup label.
/// The time comes back as an ISO-8601 UTC-offset string.
pub fn parse_backup_label(label: &str) -> anyhow::Result<(String, String)> {
    let segment = START_WAL_RE
        .captures(label)
        .and_then(|c| c.get(1))
        .context("no START WAL LOCATION line in backup label")?
        .as_str()
        .to_string();
    let raw_time = START_TIME_RE
        .captures(label)
        .and_then(|c| c.get(1))
        .context("no START TIME line in backup label")?
        .as_str()
        .trim();
    Ok((segment, parse_label_time(raw_time)?))
}

fn parse_label_time(raw: &str) -> anyhow::Result<String> {
    // The server writes e.g. "2015-02-12 14:07:19 GMT"; named zones other
    // than GMT/UTC do not occur because log_timezone does not apply here.
    let normalized = raw.replace(" GMT", " +0000").replace(" UTC", " +0000");
    let parsed = DateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S %z")
        .with_context(|| format!("unparseable START TIME {raw:?}"))?;
    Ok(parsed.to_rfc3339())
}

/// Extracts the label fields from a tar stream containing a `backup_label`
/// member, as produced by the streaming base-backup protocol.
pub async fn parse_backup_label_in_tar<R>(reader: R) -> anyhow::Result<(String, String)>
where
    R: AsyncRead + Send + Sync + Unpin,
{
    let mut archive = tokio_tar::Archive::new(reader);
    let mut entries = archive.entries().context("read archive entries")?;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context("read archive entry")?;
        let path = entry.path().context("read archive entry path")?;
        if path.as_ref() == std::path::Path::new("backup_label") {
            let mut label = String::new();
            entry
                .read_to_string(&mut label)
                .await
                .context("read backup_label from archive")?;
            return parse_backup_label(&label);
        }
    }
    anyhow::bail!("no backup_label in archive")
}
