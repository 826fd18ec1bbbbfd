//! Global agent metrics, exposed on the HTTP endpoint at `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge,
};

pub static BACKUPS_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgvault_basebackups_started_total",
        "Base backups started, by site",
        &["site"]
    )
    .expect("failed to register pgvault_basebackups_started_total counter")
});

pub static BACKUPS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgvault_basebackups_completed_total",
        "Base backups completed successfully, by site",
        &["site"]
    )
    .expect("failed to register pgvault_basebackups_completed_total counter")
});

pub static BACKUPS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgvault_basebackups_failed_total",
        "Base backups that ended in failure, by site",
        &["site"]
    )
    .expect("failed to register pgvault_basebackups_failed_total counter")
});

pub static CHUNKS_UPLOADED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgvault_chunks_uploaded_total",
        "Backup chunks uploaded, by site",
        &["site"]
    )
    .expect("failed to register pgvault_chunks_uploaded_total counter")
});

pub static UPLOADED_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgvault_uploaded_bytes_total",
        "Stored bytes uploaded to the blob store, by site",
        &["site"]
    )
    .expect("failed to register pgvault_uploaded_bytes_total counter")
});

pub static DELTA_FILES_UPLOADED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgvault_delta_files_uploaded_total",
        "Content-addressed delta blobs uploaded, by site",
        &["site"]
    )
    .expect("failed to register pgvault_delta_files_uploaded_total counter")
});

pub static DELTA_FILES_REUSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pgvault_delta_files_reused_total",
        "Delta blobs reused from prior backups, by site",
        &["site"]
    )
    .expect("failed to register pgvault_delta_files_reused_total counter")
});

pub static RUNNING_BACKUPS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "pgvault_running_basebackups",
        "Base backups currently in progress"
    )
    .expect("failed to register pgvault_running_basebackups gauge")
});

/// Renders the default registry in the text exposition format.
pub fn gather_text() -> anyhow::Result<String> {
    use prometheus::Encoder;

    let mut buf = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    encoder.encode(&prometheus::gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}
