//! The agent's control loop.
//!
//! One task owns all per-site state: the running-backup handle, the
//! manual-trigger flag, and the delta failure record. Backup execution
//! happens on separate worker tasks that report back over a callback
//! channel; the control task itself never blocks on backup I/O.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use blob_store::GenericBlobStorage;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::basebackup::{BackupError, BasebackupJob, BasebackupMode, CallbackEvent};
use crate::config::Config;
use crate::listing::{self, BackupEntry};
use crate::pg::{PgClient, PostgresApi};
use crate::scheduler::{self, BackupReason, DeltaFailureInfo};

/// State shared with the HTTP endpoint: the latest backup inventory per
/// site, refreshed by the control loop.
#[derive(Default)]
pub struct SharedState {
    pub backups: RwLock<HashMap<String, Vec<BackupEntry>>>,
}

struct RunningBackup {
    callback_rx: mpsc::Receiver<CallbackEvent>,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SiteState {
    running: Option<RunningBackup>,
    delta_failures: Option<DeltaFailureInfo>,
    manual_trigger: bool,
}

pub struct Controller {
    config: Arc<Config>,
    storages: HashMap<String, GenericBlobStorage>,
    shared: Arc<SharedState>,
    sites: HashMap<String, SiteState>,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        shared: Arc<SharedState>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let mut storages = HashMap::new();
        for (name, site) in &config.sites {
            let storage = GenericBlobStorage::from_config(&site.object_storage)
                .with_context(|| format!("initialize blob storage for site {name:?}"))?;
            storages.insert(name.clone(), storage);
        }
        Ok(Controller {
            config,
            storages,
            shared,
            sites: HashMap::new(),
            cancel,
        })
    }

    /// Runs until cancelled. `trigger_rx` delivers manual backup requests
    /// by site name.
    pub async fn run(mut self, mut trigger_rx: mpsc::Receiver<String>) -> anyhow::Result<()> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return Ok(());
                }
                requested = trigger_rx.recv() => {
                    if let Some(site_name) = requested {
                        if self.config.sites.contains_key(&site_name) {
                            info!(site = %site_name, "manual basebackup requested");
                            self.sites.entry(site_name.clone()).or_default().manual_trigger = true;
                            self.handle_site(&site_name, Utc::now()).await;
                        } else {
                            warn!("manual backup requested for unknown site {site_name:?}");
                        }
                    }
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let site_names: Vec<String> = self.config.sites.keys().cloned().collect();
                    for site_name in site_names {
                        self.handle_site(&site_name, now).await;
                    }
                }
            }
        }
    }

    async fn handle_site(&mut self, site_name: &str, now: DateTime<Utc>) {
        if let Err(e) = self.handle_site_inner(site_name, now).await {
            error!(site = %site_name, "site check failed: {e:#}");
        }
    }

    async fn handle_site_inner(
        &mut self,
        site_name: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let site = self
            .config
            .sites
            .get(site_name)
            .context("unknown site")?
            .clone();
        let state = self.sites.entry(site_name.to_string()).or_default();

        // Reap a finished backup first; a still-running one means no.
        let finished = match &mut state.running {
            Some(running) => match running.callback_rx.try_recv() {
                Ok(event) => Some(Some(event)),
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    warn!(site = %site_name, "backup task went away without reporting");
                    Some(None)
                }
            },
            None => None,
        };
        if let Some(maybe_event) = finished {
            state.running = None;
            if let Some(event) = maybe_event {
                process_callback_event(state, site_name, event, now);
            }
        }

        let storage = self
            .storages
            .get(site_name)
            .context("no storage for site")?;
        let backups = listing::list_site_basebackups(storage, &site, &self.cancel).await?;
        self.shared
            .backups
            .write()
            .expect("shared state lock poisoned")
            .insert(site_name.to_string(), backups.clone());

        let state = self.sites.entry(site_name.to_string()).or_default();
        let Some(stub) =
            scheduler::get_new_backup_details(now, &site, &backups, state.manual_trigger)
        else {
            return Ok(());
        };

        let mode = site.basebackup_mode.parse::<BasebackupMode>().ok();
        if stub.reason == BackupReason::Scheduled
            && mode == Some(BasebackupMode::Delta)
            && scheduler::delta_backups_suppressed(&site, state.delta_failures.as_ref(), now)
        {
            info!(site = %site_name, "delta backup cooldown active, skipping scheduled attempt");
            return Ok(());
        }

        state.manual_trigger = false;
        info!(
            site = %site_name,
            reason = %stub.reason,
            normalized = ?stub.normalized_backup_time,
            "starting basebackup worker"
        );

        let (callback_tx, callback_rx) = mpsc::channel(1);
        let backup_cancel = self.cancel.child_token();
        let job_cancel = backup_cancel.clone();
        let storage = storage.clone();
        let scratch_dir = self.config.scratch_dir(site_name);
        let owned_site_name = site_name.to_string();

        let handle = tokio::spawn(
            async move {
                let pg: Arc<dyn PostgresApi> =
                    match PgClient::connect(&site.connection_string).await {
                        Ok(pg) => Arc::new(pg),
                        Err(e) => {
                            let event = CallbackEvent::Failure {
                                mode: None,
                                error: BackupError::Other(
                                    e.context("connect to PostgreSQL for backup"),
                                ),
                            };
                            let _ = callback_tx.send(event).await;
                            return;
                        }
                    };
                BasebackupJob::new(
                    owned_site_name,
                    site,
                    storage,
                    pg,
                    stub,
                    scratch_dir,
                    job_cancel,
                )
                .run_safe(callback_tx)
                .await;
            }
            .instrument(info_span!("basebackup", site = %site_name)),
        );

        state.running = Some(RunningBackup {
            callback_rx,
            handle,
            cancel: backup_cancel,
        });
        Ok(())
    }

    async fn shutdown(&mut self) {
        for (site_name, state) in &mut self.sites {
            if let Some(running) = state.running.take() {
                info!(site = %site_name, "cancelling running backup for shutdown");
                running.cancel.cancel();
                if let Err(e) = running.handle.await {
                    warn!(site = %site_name, "backup task panicked during shutdown: {e}");
                }
            }
        }
    }
}

fn process_callback_event(
    state: &mut SiteState,
    site_name: &str,
    event: CallbackEvent,
    now: DateTime<Utc>,
) {
    match event {
        CallbackEvent::Success { backup_name, mode } => {
            info!(site = %site_name, backup = %backup_name, %mode, "backup finished");
            state.delta_failures = None;
        }
        CallbackEvent::Failure { mode, error } => {
            error!(site = %site_name, "backup failed: {error:#}");
            if mode == Some(BasebackupMode::Delta) {
                let retries = state
                    .delta_failures
                    .map(|f| f.retries + 1)
                    .unwrap_or(1);
                state.delta_failures = Some(DeltaFailureInfo {
                    retries,
                    last_failed_time: now,
                });
            }
        }
    }
}
