//! Agent configuration.
//!
//! Everything is read from one TOML file: a few agent-wide settings and a
//! `[sites.<name>]` table per backed-up cluster. Paths are UTF-8
//! (`camino`) throughout.

use std::collections::HashMap;

use anyhow::Context;
use blob_store::{BlobStorageConfig, RemotePath};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::compression::CompressionConfig;

pub mod defaults {
    pub const DEFAULT_LISTEN_HTTP_ADDR: &str = "127.0.0.1:16101";
    pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 60;

    pub const DEFAULT_BASEBACKUP_MODE: &str = "basic";
    pub const DEFAULT_BASEBACKUP_INTERVAL_HOURS: f64 = 24.0;
    pub const DEFAULT_BASEBACKUP_CHUNK_SIZE: u64 = 2 * 1024 * 1024 * 1024;
    pub const DEFAULT_BASEBACKUP_PARALLEL_JOBS: usize = 4;

    pub const DEFAULT_DELTA_MODE_CHUNK_SIZE: u64 = 128 * 1024 * 1024;
    pub const DEFAULT_DELTA_MODE_MIN_DELTA_FILE_SIZE: u64 = 4 * 1024 * 1024;
    pub const DEFAULT_DELTA_MODE_MAX_RETRIES: u32 = 2;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Scratch space for staging chunks and archives before upload.
    pub backup_location: Utf8PathBuf,
    #[serde(default = "default_listen_http_addr")]
    pub listen_http_addr: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    pub sites: HashMap<String, SiteConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveBackupMode {
    ArchiveCommand,
    StandaloneHotBackup,
}

impl ActiveBackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveBackupMode::ArchiveCommand => "archive_command",
            ActiveBackupMode::StandaloneHotBackup => "standalone_hot_backup",
        }
    }
}

/// One key in the site's encryption key ring. Backups need the public
/// (recipient) half, restores the secret (identity) half; a host doing
/// both carries both.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EncryptionKey {
    pub public: Option<String>,
    pub private: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    /// Key prefix inside the object store, e.g. `prod/main`.
    pub prefix: String,
    pub pg_data_directory: Utf8PathBuf,
    /// Connection string for the snapshot barrier and introspection queries.
    pub connection_string: String,
    /// Directory holding `pg_basebackup`; taken from `$PATH` when unset.
    pub pg_bin_directory: Option<Utf8PathBuf>,

    /// Validated when a backup starts, not here, so that a bad value fails
    /// the backup through the regular callback channel.
    #[serde(default = "default_basebackup_mode")]
    pub basebackup_mode: String,
    #[serde(default = "default_active_backup_mode")]
    pub active_backup_mode: ActiveBackupMode,

    #[serde(default = "default_interval_hours")]
    pub basebackup_interval_hours: f64,
    pub basebackup_hour: Option<u32>,
    pub basebackup_minute: Option<u32>,

    #[serde(default = "default_chunk_size")]
    pub basebackup_chunk_size: u64,
    #[serde(default = "default_parallel_jobs")]
    pub basebackup_parallel_jobs: usize,

    #[serde(default = "default_delta_chunk_size")]
    pub basebackup_delta_mode_chunk_size: u64,
    #[serde(default = "default_min_delta_file_size")]
    pub basebackup_delta_mode_min_delta_file_size: u64,
    #[serde(default = "default_delta_max_retries")]
    pub basebackup_delta_mode_max_retries: u32,

    pub encryption_key_id: Option<String>,
    #[serde(default)]
    pub encryption_keys: HashMap<String, EncryptionKey>,

    #[serde(default)]
    pub compression: CompressionConfig,

    pub object_storage: BlobStorageConfig,

    /// `restore_command` written into the recovery configuration of a
    /// restored cluster.
    pub restore_command: Option<String>,
}

fn default_listen_http_addr() -> String {
    defaults::DEFAULT_LISTEN_HTTP_ADDR.to_string()
}

fn default_poll_interval() -> u64 {
    defaults::DEFAULT_POLL_INTERVAL_SECONDS
}

fn default_basebackup_mode() -> String {
    defaults::DEFAULT_BASEBACKUP_MODE.to_string()
}

fn default_active_backup_mode() -> ActiveBackupMode {
    ActiveBackupMode::ArchiveCommand
}

fn default_interval_hours() -> f64 {
    defaults::DEFAULT_BASEBACKUP_INTERVAL_HOURS
}

fn default_chunk_size() -> u64 {
    defaults::DEFAULT_BASEBACKUP_CHUNK_SIZE
}

fn default_parallel_jobs() -> usize {
    defaults::DEFAULT_BASEBACKUP_PARALLEL_JOBS
}

fn default_delta_chunk_size() -> u64 {
    defaults::DEFAULT_DELTA_MODE_CHUNK_SIZE
}

fn default_min_delta_file_size() -> u64 {
    defaults::DEFAULT_DELTA_MODE_MIN_DELTA_FILE_SIZE
}

fn default_delta_max_retries() -> u32 {
    defaults::DEFAULT_DELTA_MODE_MAX_RETRIES
}

impl Config {
    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {path:?}"))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("parse config file {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.sites.is_empty(), "no backup sites configured");
        for (name, site) in &self.sites {
            anyhow::ensure!(!site.prefix.is_empty(), "site {name:?} has an empty prefix");
            anyhow::ensure!(
                !site.prefix.starts_with('/'),
                "site {name:?} prefix must be relative to the store root"
            );
            if let Some(hour) = site.basebackup_hour {
                anyhow::ensure!(hour < 24, "site {name:?} basebackup_hour out of range");
            }
            if let Some(minute) = site.basebackup_minute {
                anyhow::ensure!(minute < 60, "site {name:?} basebackup_minute out of range");
            }
            anyhow::ensure!(
                site.basebackup_interval_hours >= 0.0,
                "site {name:?} basebackup_interval_hours must not be negative"
            );
            anyhow::ensure!(
                site.basebackup_parallel_jobs >= 1,
                "site {name:?} basebackup_parallel_jobs must be at least 1"
            );
            if let Some(key_id) = &site.encryption_key_id {
                anyhow::ensure!(
                    site.encryption_keys.contains_key(key_id),
                    "site {name:?} encryption_key_id {key_id:?} has no entry in encryption_keys"
                );
            }
        }
        Ok(())
    }

    pub fn scratch_dir(&self, site_name: &str) -> Utf8PathBuf {
        self.backup_location.join(site_name).join("basebackup_incoming")
    }

    /// Looks up a site by name, or picks the only configured one.
    pub fn site(&self, name: Option<&str>) -> anyhow::Result<(&str, &SiteConfig)> {
        match name {
            Some(name) => self
                .sites
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .with_context(|| format!("site {name:?} is not configured")),
            None => {
                anyhow::ensure!(
                    self.sites.len() == 1,
                    "multiple sites configured, --site is required"
                );
                Ok(self
                    .sites
                    .iter()
                    .map(|(k, v)| (k.as_str(), v))
                    .next()
                    .expect("length checked above"))
            }
        }
    }
}

impl SiteConfig {
    pub fn has_backup_schedule(&self) -> bool {
        self.basebackup_hour.is_some() && self.basebackup_minute.is_some()
    }

    fn site_prefix(&self) -> RemotePath {
        RemotePath::from_string(self.prefix.trim_end_matches('/'))
            .expect("validated to be relative at config load")
    }

    /// `<prefix>/basebackup`
    pub fn basebackup_prefix(&self) -> RemotePath {
        self.site_prefix().join("basebackup")
    }

    /// `<prefix>/basebackup/<name>`
    pub fn basebackup_key(&self, backup_name: &str) -> RemotePath {
        self.basebackup_prefix().join(backup_name)
    }

    /// `<prefix>/basebackup_chunk/<name>/<nnn>` or
    /// `<prefix>/basebackup_delta_chunk/<name>/<nnn>` for delta-mode chunks.
    pub fn chunk_key(&self, backup_name: &str, index: u64, delta: bool) -> RemotePath {
        let kind = if delta {
            "basebackup_delta_chunk"
        } else {
            "basebackup_chunk"
        };
        self.site_prefix()
            .join(kind)
            .join(backup_name)
            .join(format!("{index:08}"))
    }

    pub fn chunk_prefix(&self, delta: bool) -> RemotePath {
        let kind = if delta {
            "basebackup_delta_chunk"
        } else {
            "basebackup_chunk"
        };
        self.site_prefix().join(kind)
    }

    /// `<prefix>/basebackup_delta/<hex-digest>`
    pub fn delta_file_key(&self, hexdigest: &str) -> RemotePath {
        self.site_prefix().join("basebackup_delta").join(hexdigest)
    }

    pub fn delta_prefix(&self) -> RemotePath {
        self.site_prefix().join("basebackup_delta")
    }

    /// `<prefix>/preservation_request`
    pub fn preservation_prefix(&self) -> RemotePath {
        self.site_prefix().join("preservation_request")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const MINIMAL_SITE_TOML: &str = r#"
        prefix = "a/b/c"
        pg_data_directory = "/var/lib/postgresql/data"
        connection_string = "host=localhost user=backup dbname=postgres"

        [object_storage]
        kind = "local-fs"
        local_path = "/var/lib/pgvault/store"
    "#;

    #[test]
    fn site_defaults_are_applied() {
        let site: SiteConfig = toml::from_str(MINIMAL_SITE_TOML).unwrap();
        assert_eq!(site.basebackup_mode, "basic");
        assert_eq!(site.active_backup_mode, ActiveBackupMode::ArchiveCommand);
        assert_eq!(site.basebackup_interval_hours, 24.0);
        assert_eq!(site.basebackup_parallel_jobs, 4);
        assert!(!site.has_backup_schedule());
        assert!(site.encryption_key_id.is_none());
    }

    #[test]
    fn key_layout_is_stable() {
        let site: SiteConfig = toml::from_str(MINIMAL_SITE_TOML).unwrap();
        assert_eq!(
            site.basebackup_key("2024-01-02_03-04-05").to_string(),
            "a/b/c/basebackup/2024-01-02_03-04-05"
        );
        assert_eq!(
            site.chunk_key("b", 7, false).to_string(),
            "a/b/c/basebackup_chunk/b/00000007"
        );
        assert_eq!(
            site.chunk_key("b", 0, true).to_string(),
            "a/b/c/basebackup_delta_chunk/b/00000000"
        );
        assert_eq!(
            site.delta_file_key("ab12").to_string(),
            "a/b/c/basebackup_delta/ab12"
        );
        assert_eq!(
            site.preservation_prefix().to_string(),
            "a/b/c/preservation_request"
        );
    }

    #[test]
    fn hour_range_is_validated() {
        let mut site: SiteConfig = toml::from_str(MINIMAL_SITE_TOML).unwrap();
        site.basebackup_hour = Some(25);
        let config = Config {
            backup_location: Utf8PathBuf::from("/tmp/pgvault"),
            listen_http_addr: default_listen_http_addr(),
            poll_interval_seconds: default_poll_interval(),
            sites: HashMap::from([("bad".to_string(), site)]),
        };
        assert!(config.validate().is_err());
    }
}
