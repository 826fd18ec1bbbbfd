//! The pgvault agent: watches the configured sites, takes base backups on
//! schedule, and serves the enumeration endpoint.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

use pgvault::config::Config;
use pgvault::control::{Controller, SharedState};
use pgvault::http::{self, HttpServerState};

#[derive(Parser)]
#[command(name = "pgvault", about = "Continuous physical backup agent for PostgreSQL")]
struct Args {
    /// Path to the agent configuration file.
    #[arg(long, value_name = "FILE")]
    config: Utf8PathBuf,
    /// Log at debug level.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    utils::logging::init(if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    })?;

    let config = Arc::new(Config::load(&args.config)?);
    info!(
        "starting pgvault, {} site(s), listening on {}",
        config.sites.len(),
        config.listen_http_addr
    );

    let cancel = CancellationToken::new();
    let shared = Arc::new(SharedState::default());
    let (trigger_tx, trigger_rx) = mpsc::channel(16);

    let controller = Controller::new(Arc::clone(&config), Arc::clone(&shared), cancel.clone())?;

    let http_state = Arc::new(HttpServerState {
        shared,
        trigger_tx,
    });
    let http_task = tokio::spawn({
        let listen_addr = config.listen_http_addr.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = http::serve(&listen_addr, http_state, cancel).await {
                error!("http endpoint failed: {e:#}");
            }
        }
    });

    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown_cancel.cancel();
        }
    });

    let result = controller.run(trigger_rx).await;
    cancel.cancel();
    http_task.await.context("join http task")?;
    result
}
