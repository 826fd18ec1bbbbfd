//! Small shared pieces used by every `pgvault` crate.

pub mod backoff;
pub mod logging;
