//! Operator CLI for listing and restoring base backups.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blob_store::GenericBlobStorage;
use camino::Utf8PathBuf;
use chrono::{DateTime, FixedOffset};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;

use pgvault::config::Config;
use pgvault::listing::{self, BackupLister, HttpLister};
use pgvault::preserve;
use pgvault::restore::{restore_basebackup, DownloadProgress, RestoreOptions};

#[derive(Parser)]
#[command(name = "pgvault_restore", about = "Restore PostgreSQL base backups taken by pgvault")]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<Utf8PathBuf>,
    /// Site to operate on; optional when only one site is configured.
    #[arg(long, global = true)]
    site: Option<String>,
    /// Log at debug level.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List basebackups available for the site.
    ListBasebackups {
        /// List through a running agent's HTTP endpoint instead of the
        /// object store.
        #[arg(long, requires = "http_port")]
        http_host: Option<String>,
        #[arg(long, requires = "http_host")]
        http_port: Option<u16>,
    },
    /// Download and restore a basebackup.
    GetBasebackup {
        #[arg(long, value_name = "DIR")]
        target_dir: Utf8PathBuf,
        /// Basebackup to restore; the latest one when omitted.
        #[arg(long)]
        basebackup: Option<String>,
        /// Restore a tablespace into a specific directory, as name=path.
        /// May be given multiple times.
        #[arg(long = "tablespace-dir", value_name = "NAME=PATH")]
        tablespace_dir: Vec<String>,
        /// Restore on top of a non-empty target directory.
        #[arg(long)]
        overwrite: bool,
        /// Protect the restored backup from retention until this time.
        #[arg(long, value_name = "ISO8601")]
        preserve_until: Option<String>,
        /// Drop the preservation request once the restore succeeded
        /// (the default).
        #[arg(long)]
        cancel_preserve_on_success: bool,
        /// Keep the preservation request after a successful restore.
        #[arg(long, conflicts_with = "cancel_preserve_on_success")]
        no_cancel_preserve_on_success: bool,
        /// Configure the restored node to start as a primary.
        #[arg(long)]
        restore_to_primary: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    if let Err(e) = utils::logging::init(level) {
        eprintln!("FATAL: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        eprintln!("FATAL: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .as_ref()
        .context("--config is required")?;
    let config = Config::load(config_path)?;
    let (site_name, site) = config.site(cli.site.as_deref())?;
    let cancel = CancellationToken::new();

    match cli.command {
        Command::ListBasebackups {
            http_host,
            http_port,
        } => {
            let lister = match (http_host, http_port) {
                (Some(host), Some(port)) => {
                    BackupLister::Http(HttpLister::new(&host, port, site_name))
                }
                _ => BackupLister::Bucket {
                    storage: GenericBlobStorage::from_config(&site.object_storage)?,
                    site: Box::new(site.clone()),
                },
            };
            let backups = lister.list_basebackups(&cancel).await?;
            listing::print_basebackup_list(
                &backups,
                &format!("Available {site_name:?} basebackups:"),
                cli.verbose,
            );
        }
        Command::GetBasebackup {
            target_dir,
            basebackup,
            tablespace_dir,
            overwrite,
            preserve_until,
            cancel_preserve_on_success,
            no_cancel_preserve_on_success,
            restore_to_primary,
        } => {
            let storage = GenericBlobStorage::from_config(&site.object_storage)?;

            let mut options = RestoreOptions::new(target_dir);
            options.backup_name = basebackup;
            options.overwrite = overwrite;
            options.restore_to_primary = restore_to_primary;
            options.tablespace_mapping = parse_tablespace_mapping(&tablespace_dir)?;
            options.parallel_jobs = site.basebackup_parallel_jobs;

            let progress = Arc::new(DownloadProgress::default());
            options.progress = Some(Arc::clone(&progress));

            // Preservation is advisory: it needs the backup's name up
            // front, and its failures must not fail the restore.
            let preservation_request = match &preserve_until {
                Some(raw) => {
                    let preserve_until: DateTime<FixedOffset> = raw
                        .parse()
                        .with_context(|| format!("unparseable --preserve-until {raw:?}"))?;
                    let backups =
                        listing::list_site_basebackups(&storage, site, &cancel).await?;
                    let name = match &options.backup_name {
                        Some(name) => name.clone(),
                        None => backups
                            .last()
                            .context("No basebackups found for the site")?
                            .name
                            .clone(),
                    };
                    options.backup_name = Some(name.clone());
                    preserve::try_request_backup_preservation(
                        &storage,
                        site,
                        &name,
                        &preserve_until,
                        &cancel,
                    )
                    .await
                }
                None => None,
            };

            let reporter = tokio::spawn({
                let progress = Arc::clone(&progress);
                async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(2));
                    // the first tick completes immediately
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let total = progress.total_blobs.load(Ordering::Relaxed);
                        if total == 0 {
                            continue;
                        }
                        eprintln!(
                            "downloaded {} MB, {}/{} objects",
                            progress.downloaded_bytes.load(Ordering::Relaxed) / (1024 * 1024),
                            progress.completed_blobs.load(Ordering::Relaxed),
                            total
                        );
                    }
                }
            });
            let restored = restore_basebackup(&storage, site, &options, &cancel).await;
            reporter.abort();
            let restored = restored?;

            let cancel_preserve = cancel_preserve_on_success || !no_cancel_preserve_on_success;
            if let Some(request_name) = preservation_request {
                if cancel_preserve {
                    preserve::try_cancel_backup_preservation(
                        &storage,
                        site,
                        &request_name,
                        &cancel,
                    )
                    .await;
                }
            }

            println!(
                "Basebackup {restored} restored to {}",
                options.target_dir
            );
        }
    }
    Ok(())
}

fn parse_tablespace_mapping(
    raw_mappings: &[String],
) -> anyhow::Result<HashMap<String, Utf8PathBuf>> {
    let mut mapping = HashMap::new();
    for raw in raw_mappings {
        let (name, path) = raw
            .split_once('=')
            .with_context(|| format!("invalid tablespace mapping {raw:?}, expected NAME=PATH"))?;
        if mapping
            .insert(name.to_string(), Utf8PathBuf::from(path))
            .is_some()
        {
            anyhow::bail!("tablespace {name:?} mapped twice");
        }
    }
    Ok(mapping)
}
