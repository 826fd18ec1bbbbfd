//! The PostgreSQL control-plane seam.
//!
//! Everything the executor needs from the database goes through the
//! [`PostgresApi`] trait: the liveness probe, version and recovery-state
//! introspection, the non-exclusive snapshot barrier, and tablespace
//! discovery. Production uses [`PgClient`] over tokio-postgres; tests
//! supply their own implementation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use crate::config::{ActiveBackupMode, SiteConfig};

const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// First server version with `pg_backup_start`/`pg_backup_stop`.
const PG_NEW_BACKUP_API_VERSION: u32 = 150000;
/// First server version with `pg_wal` instead of `pg_xlog`.
pub const PG_WAL_DIR_VERSION: u32 = 100000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgTablespace {
    pub name: String,
    pub oid: u32,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedBackup {
    /// Verbatim backup_label contents from the snapshot protocol.
    pub backup_label: String,
    pub end_lsn: String,
    /// Present only when the server is a primary.
    pub end_wal_segment: Option<String>,
    pub end_time: DateTime<Utc>,
}

#[async_trait]
pub trait PostgresApi: Send + Sync {
    /// Whether the backup's database connection still answers.
    async fn check_connection_alive(&self) -> bool;

    /// `server_version_num`, e.g. 150004.
    async fn server_version_num(&self) -> anyhow::Result<u32>;

    async fn is_in_recovery(&self) -> anyhow::Result<bool>;

    async fn list_tablespaces(&self) -> anyhow::Result<Vec<PgTablespace>>;

    /// Opens the non-exclusive snapshot barrier.
    async fn start_backup(&self, label: &str) -> anyhow::Result<()>;

    /// Closes the barrier, returning the label text and end position.
    async fn stop_backup(&self) -> anyhow::Result<StoppedBackup>;
}

pub struct PgClient {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PgClient {
    pub async fn connect(conninfo: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(conninfo, NoTls)
            .await
            .context("connect to PostgreSQL")?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection error: {e}");
            }
        });
        Ok(PgClient {
            client,
            connection_task,
        })
    }
}

impl Drop for PgClient {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl PostgresApi for PgClient {
    async fn check_connection_alive(&self) -> bool {
        matches!(
            tokio::time::timeout(LIVENESS_PROBE_TIMEOUT, self.client.simple_query("SELECT 1"))
                .await,
            Ok(Ok(_))
        )
    }

    async fn server_version_num(&self) -> anyhow::Result<u32> {
        let row = self
            .client
            .query_one("SHOW server_version_num", &[])
            .await
            .context("query server_version_num")?;
        let version: String = row.get(0);
        version
            .parse()
            .with_context(|| format!("unexpected server_version_num {version:?}"))
    }

    async fn is_in_recovery(&self) -> anyhow::Result<bool> {
        let row = self
            .client
            .query_one("SELECT pg_is_in_recovery()", &[])
            .await
            .context("query pg_is_in_recovery")?;
        Ok(row.get(0))
    }

    async fn list_tablespaces(&self) -> anyhow::Result<Vec<PgTablespace>> {
        let rows = self
            .client
            .query(
                "SELECT spcname, oid, pg_tablespace_location(oid) AS location \
                 FROM pg_tablespace \
                 WHERE spcname NOT IN ('pg_default', 'pg_global')",
                &[],
            )
            .await
            .context("query pg_tablespace")?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let path: String = row.get("location");
                if path.is_empty() {
                    return None;
                }
                Some(PgTablespace {
                    name: row.get("spcname"),
                    oid: row.get("oid"),
                    path,
                })
            })
            .collect())
    }

    async fn start_backup(&self, label: &str) -> anyhow::Result<()> {
        let version = self.server_version_num().await?;
        let statement = if version >= PG_NEW_BACKUP_API_VERSION {
            "SELECT pg_backup_start($1, true)::text"
        } else {
            // non-exclusive variant
            "SELECT pg_start_backup($1, true, false)::text"
        };
        let row = self
            .client
            .query_one(statement, &[&label])
            .await
            .context("start base backup")?;
        let start_lsn: String = row.get(0);
        debug!("base backup started at {start_lsn}");
        Ok(())
    }

    async fn stop_backup(&self) -> anyhow::Result<StoppedBackup> {
        let version = self.server_version_num().await?;
        let statement = if version >= PG_NEW_BACKUP_API_VERSION {
            "SELECT lsn::text, labelfile FROM pg_backup_stop(true)"
        } else {
            "SELECT lsn::text, labelfile FROM pg_stop_backup(false, true)"
        };
        let row = self
            .client
            .query_one(statement, &[])
            .await
            .context("stop base backup")?;
        let end_lsn: String = row.get(0);
        let backup_label: String = row.get(1);

        let end_wal_segment = if self.is_in_recovery().await? {
            None
        } else {
            let statement = if version >= PG_WAL_DIR_VERSION {
                "SELECT pg_walfile_name(CAST($1 AS pg_lsn))"
            } else {
                "SELECT pg_xlogfile_name(CAST($1 AS pg_lsn))"
            };
            let row = self
                .client
                .query_one(statement, &[&end_lsn])
                .await
                .context("resolve end wal segment")?;
            Some(row.get(0))
        };

        Ok(StoppedBackup {
            backup_label,
            end_lsn,
            end_wal_segment,
            end_time: Utc::now(),
        })
    }
}

/// Assembles the `pg_basebackup` invocation used by the `basic` and `pipe`
/// modes. `pgdata_target` is a directory for `basic` or `-` for `pipe`.
pub fn pg_basebackup_command(
    site: &SiteConfig,
    pgdata_target: &Utf8Path,
) -> tokio::process::Command {
    let binary = match &site.pg_bin_directory {
        Some(dir) => dir.join("pg_basebackup").to_string(),
        None => "pg_basebackup".to_string(),
    };
    let wal_method = match site.active_backup_mode {
        // the produced archive must boot on its own, so it carries its WAL
        ActiveBackupMode::StandaloneHotBackup => "fetch",
        ActiveBackupMode::ArchiveCommand => "none",
    };
    let mut command = tokio::process::Command::new(binary);
    command
        .arg("--format=tar")
        .arg("--label=pgvault_base_backup")
        .arg("--wal-method")
        .arg(wal_method)
        .arg("--pgdata")
        .arg(pgdata_target.as_str())
        .arg("--dbname")
        .arg(&site.connection_string)
        .arg("--no-password")
        .kill_on_drop(true)
        .stdin(std::process::Stdio::null());
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basebackup_command_reflects_active_backup_mode() {
        let mut site: SiteConfig = toml::from_str(
            r#"
            prefix = "a/b/c"
            pg_data_directory = "/nonexistent"
            connection_string = "host=localhost user=backup"
            pg_bin_directory = "/usr/lib/postgresql/15/bin"

            [object_storage]
            kind = "local-fs"
            local_path = "/nonexistent"
        "#,
        )
        .unwrap();

        let command = pg_basebackup_command(&site, Utf8Path::new("-"));
        let program = command.as_std().get_program().to_string_lossy().to_string();
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(program, "/usr/lib/postgresql/15/bin/pg_basebackup");
        assert!(args.contains(&"--format=tar".to_string()));
        assert!(args.windows(2).any(|w| w == ["--wal-method", "none"]));
        assert!(args.windows(2).any(|w| w == ["--pgdata", "-"]));

        site.active_backup_mode = ActiveBackupMode::StandaloneHotBackup;
        let command = pg_basebackup_command(&site, Utf8Path::new("/tmp/base"));
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.windows(2).any(|w| w == ["--wal-method", "fetch"]));
    }
}
