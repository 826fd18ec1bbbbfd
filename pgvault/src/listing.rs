//! Backup inventory: the normalized view of what exists for a site.
//!
//! Two sources produce the same entries: the blob store itself, and the
//! agent's HTTP enumeration endpoint for clients without store
//! credentials. Only the store-backed source can also fetch manifests,
//! stream archive bytes and request preservation; the HTTP source is
//! list-only.

use std::collections::HashMap;

use anyhow::Context;
use blob_store::{GenericBlobStorage, ListEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::config::SiteConfig;
use crate::encryption::{self, ENCRYPTION_KEY_ID_META};
use crate::manifest::{BackupFormat, BackupManifest};
use crate::scheduler::BackupReason;

pub mod meta_keys {
    pub const START_TIME: &str = "start-time";
    pub const END_TIME: &str = "end-time";
    pub const START_WAL_SEGMENT: &str = "start-wal-segment";
    pub const END_WAL_SEGMENT: &str = "end-wal-segment";
    pub const PG_VERSION: &str = "pg-version";
    pub const BASEBACKUP_MODE: &str = "basebackup-mode";
    pub const ACTIVE_BACKUP_MODE: &str = "active-backup-mode";
    pub const BACKUP_REASON: &str = "backup-reason";
    pub const BACKUP_DECISION_TIME: &str = "backup-decision-time";
    pub const NORMALIZED_BACKUP_TIME: &str = "normalized-backup-time";
    pub const FORMAT: &str = "format";
    pub const TOTAL_SIZE_ENC: &str = "total-size-enc";
    pub const TOTAL_SIZE_PLAIN: &str = "total-size-plain";
}

/// One backup as the rest of the agent sees it: the key's leaf name plus
/// the metadata map, with parsing and defaulting behind accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl BackupEntry {
    pub fn from_list_entry(entry: ListEntry) -> Self {
        let name = entry
            .key
            .object_name()
            .unwrap_or_default()
            .to_string();
        BackupEntry {
            name,
            size: entry.size,
            metadata: entry.metadata.0,
        }
    }

    fn parse_time(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.metadata.get(key)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.parse_time(meta_keys::START_TIME)
    }

    /// Entries written before the scheduler recorded decisions default to
    /// `scheduled` taken at their start time.
    pub fn backup_reason(&self) -> BackupReason {
        match self.metadata.get(meta_keys::BACKUP_REASON).map(String::as_str) {
            Some("requested") => BackupReason::Requested,
            _ => BackupReason::Scheduled,
        }
    }

    pub fn backup_decision_time(&self) -> Option<DateTime<Utc>> {
        self.parse_time(meta_keys::BACKUP_DECISION_TIME)
            .or_else(|| self.start_time())
    }

    pub fn normalized_backup_time(&self) -> Option<&str> {
        self.metadata
            .get(meta_keys::NORMALIZED_BACKUP_TIME)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn format(&self) -> Option<BackupFormat> {
        self.metadata
            .get(meta_keys::FORMAT)?
            .parse::<BackupFormat>()
            .ok()
    }
}

/// Lists `<prefix>/basebackup`, oldest first by start time.
pub async fn list_site_basebackups(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<BackupEntry>> {
    let listed = storage
        .list(&site.basebackup_prefix(), false, cancel)
        .await
        .context("list basebackups")?;
    let mut entries: Vec<BackupEntry> =
        listed.into_iter().map(BackupEntry::from_list_entry).collect();
    entries.sort_by(|a, b| {
        a.start_time()
            .cmp(&b.start_time())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(entries)
}

/// Fetches and decodes the manifest blob of a chunked backup, decrypting
/// it first when its metadata names an encryption key.
pub async fn fetch_backup_manifest(
    storage: &GenericBlobStorage,
    site: &SiteConfig,
    backup_name: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<BackupManifest> {
    let key = site.basebackup_key(backup_name);
    let (bytes, metadata) = storage
        .get_bytes(&key, cancel)
        .await
        .with_context(|| format!("fetch backup manifest {key}"))?;

    let plain = match metadata.get(ENCRYPTION_KEY_ID_META) {
        Some(key_id) => {
            let identity = encryption::identity_for(site, key_id)?;
            let mut reader =
                encryption::decrypt_reader(&identity, std::io::Cursor::new(bytes)).await?;
            let mut plain = Vec::new();
            reader
                .read_to_end(&mut plain)
                .await
                .context("decrypt backup manifest")?;
            bytes::Bytes::from(plain)
        }
        None => bytes,
    };

    BackupManifest::from_bytes(&plain)
        .await
        .with_context(|| format!("decode backup manifest {backup_name}"))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BasebackupListResponse {
    pub basebackups: Vec<BackupEntry>,
}

/// List-only client for the agent's HTTP enumeration API.
pub struct HttpLister {
    client: reqwest::Client,
    base_url: String,
    site: String,
}

impl HttpLister {
    pub fn new(host: &str, port: u16, site: impl Into<String>) -> Self {
        HttpLister {
            client: reqwest::Client::new(),
            base_url: format!("http://{host}:{port}"),
            site: site.into(),
        }
    }

    pub async fn list_basebackups(&self) -> anyhow::Result<Vec<BackupEntry>> {
        let url = format!("{}/{}/basebackup", self.base_url, self.site);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request {url}"))?
            .error_for_status()
            .with_context(|| format!("request {url}"))?;
        let mut listed: BasebackupListResponse =
            response.json().await.context("parse basebackup listing")?;
        listed
            .basebackups
            .sort_by(|a, b| a.start_time().cmp(&b.start_time()).then_with(|| a.name.cmp(&b.name)));
        Ok(listed.basebackups)
    }
}

/// The two inventory sources behind one listing call.
pub enum BackupLister {
    Bucket {
        storage: GenericBlobStorage,
        site: Box<SiteConfig>,
    },
    Http(HttpLister),
}

impl BackupLister {
    pub async fn list_basebackups(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<BackupEntry>> {
        match self {
            BackupLister::Bucket { storage, site } => {
                list_site_basebackups(storage, site, cancel).await
            }
            BackupLister::Http(http) => http.list_basebackups().await,
        }
    }
}

/// Operator-facing table of available backups.
pub fn print_basebackup_list(entries: &[BackupEntry], caption: &str, verbose: bool) {
    println!("{caption}\n");
    println!(
        "{:<40}  {:>11}  {:>11}  {:<20}",
        "Basebackup", "Backup size", "Orig size", "Start time"
    );
    println!(
        "{:<40}  {:>11}  {:>11}  {:<20}",
        "-".repeat(40),
        "-".repeat(11),
        "-".repeat(11),
        "-".repeat(20)
    );
    for entry in entries {
        let start_time = entry
            .start_time()
            .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "n/a".to_string());
        let stored = entry
            .metadata
            .get(meta_keys::TOTAL_SIZE_ENC)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(entry.size);
        let plain = entry
            .metadata
            .get(meta_keys::TOTAL_SIZE_PLAIN)
            .and_then(|v| v.parse::<u64>().ok());
        let plain = match plain {
            Some(bytes) => format!("{} MB", bytes / (1024 * 1024)),
            None => "n/a".to_string(),
        };
        println!(
            "{:<40}  {:>11}  {:>11}  {:<20}",
            entry.name,
            format!("{} MB", stored / (1024 * 1024)),
            plain,
            start_time
        );
        if verbose {
            let mut keys: Vec<_> = entry.metadata.keys().collect();
            keys.sort();
            for key in keys {
                println!("    {key}: {}", entry.metadata[key]);
            }
        }
    }
}
