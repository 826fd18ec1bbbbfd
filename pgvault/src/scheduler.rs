//! Decides whether a site is due for a base backup.
//!
//! Scheduled backups anchor to a normalized clock derived from the site's
//! `basebackup_hour`/`basebackup_minute` and interval, which keeps the
//! cadence independent of agent restarts. All functions take `now` as an
//! argument; only the control loop reads the wall clock.

use std::fmt;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SiteConfig;
use crate::listing::BackupEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupReason {
    Scheduled,
    Requested,
}

impl BackupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupReason::Scheduled => "scheduled",
            BackupReason::Requested => "requested",
        }
    }
}

impl fmt::Display for BackupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The metadata stub a positive decision produces; the executor augments
/// it into the full backup entry metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStub {
    pub reason: BackupReason,
    pub decision_time: DateTime<Utc>,
    pub normalized_backup_time: Option<String>,
}

/// Per-site record of failed delta backups, kept by the control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaFailureInfo {
    pub retries: u32,
    pub last_failed_time: DateTime<Utc>,
}

fn interval_duration(site: &SiteConfig) -> Duration {
    Duration::milliseconds((site.basebackup_interval_hours * 3_600_000.0) as i64)
}

/// The nearest past instant of the site's normalized schedule: the anchor
/// `today at hour:minute` shifted by whole intervals to land at or before
/// `now`. `None` when the site has no schedule configured.
pub fn normalized_backup_time(site: &SiteConfig, now: DateTime<Utc>) -> Option<String> {
    let (hour, minute) = (site.basebackup_hour?, site.basebackup_minute?);
    let interval = interval_duration(site);

    let anchor_time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let mut normalized = now
        .date_naive()
        .and_time(anchor_time)
        .and_utc();
    if normalized > now {
        normalized -= Duration::days(1);
    }
    if interval > Duration::zero() {
        let behind = (now - normalized).num_milliseconds();
        let steps = behind / interval.num_milliseconds();
        normalized += interval * steps as i32;
    }
    Some(normalized.to_rfc3339())
}

/// One scheduling decision. `backups` must be ordered oldest first, the
/// way the backup list refresh produces it; `manual_trigger` reflects an
/// operator request and always wins.
///
/// Pure function of its inputs: calling it again with the same arguments
/// returns the same decision and mutates nothing.
pub fn get_new_backup_details(
    now: DateTime<Utc>,
    site: &SiteConfig,
    backups: &[BackupEntry],
    manual_trigger: bool,
) -> Option<BackupStub> {
    let normalized = normalized_backup_time(site, now);

    let reason = if manual_trigger {
        Some(BackupReason::Requested)
    } else if site.basebackup_interval_hours <= 0.0 {
        // Interval zero disables scheduled backups for the site.
        None
    } else if backups.is_empty() {
        Some(BackupReason::Scheduled)
    } else {
        let last = backups.last().expect("non-empty");
        let interval_elapsed = match last.start_time() {
            Some(start_time) => now - start_time >= interval_duration(site),
            // Unparseable start time never blocks future backups.
            None => true,
        };
        if site.has_backup_schedule() {
            let window_changed =
                last.normalized_backup_time() != normalized.as_deref();
            (window_changed && interval_elapsed).then_some(BackupReason::Scheduled)
        } else {
            interval_elapsed.then_some(BackupReason::Scheduled)
        }
    };

    reason.map(|reason| BackupStub {
        reason,
        decision_time: now,
        normalized_backup_time: normalized,
    })
}

/// Failure cooldown for delta mode: once the budget is exhausted,
/// scheduled attempts stay suppressed until a full interval has passed
/// since the last failure. Explicit requests are never suppressed.
pub fn delta_backups_suppressed(
    site: &SiteConfig,
    failures: Option<&DeltaFailureInfo>,
    now: DateTime<Utc>,
) -> bool {
    let Some(failures) = failures else {
        return false;
    };
    failures.retries > site.basebackup_delta_mode_max_retries
        && now - failures.last_failed_time < interval_duration(site)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn test_site() -> SiteConfig {
        toml::from_str(
            r#"
            prefix = "a/b/c"
            pg_data_directory = "/nonexistent"
            connection_string = ""

            [object_storage]
            kind = "local-fs"
            local_path = "/nonexistent"
        "#,
        )
        .unwrap()
    }

    fn entry(start_time: &str, normalized: Option<&str>, reason: &str) -> BackupEntry {
        let mut metadata = HashMap::from([
            ("start-time".to_string(), start_time.to_string()),
            ("backup-reason".to_string(), reason.to_string()),
        ]);
        if let Some(normalized) = normalized {
            metadata.insert(
                "normalized-backup-time".to_string(),
                normalized.to_string(),
            );
        }
        BackupEntry {
            name: format!("backup_{start_time}"),
            size: 1,
            metadata,
        }
    }

    #[test]
    fn normalized_windows_follow_the_interval() {
        let mut site = test_site();
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 15, 20, 30).unwrap();

        // no schedule configured
        assert_eq!(normalized_backup_time(&site, now), None);

        site.basebackup_hour = Some(13);
        site.basebackup_minute = Some(10);
        assert_eq!(
            normalized_backup_time(&site, now).unwrap(),
            "2024-03-07T13:10:00+00:00"
        );

        site.basebackup_interval_hours = 1.5;
        assert_eq!(
            normalized_backup_time(&site, now).unwrap(),
            "2024-03-07T14:40:00+00:00"
        );

        // anchor in the future rolls back to yesterday's schedule
        let early = Utc.with_ymd_and_hms(2024, 3, 7, 1, 0, 0).unwrap();
        site.basebackup_interval_hours = 24.0;
        assert_eq!(
            normalized_backup_time(&site, early).unwrap(),
            "2024-03-06T13:10:00+00:00"
        );
    }

    #[test]
    fn scheduled_decisions_against_normalized_windows() {
        let mut site = test_site();
        site.basebackup_hour = Some(13);
        site.basebackup_minute = Some(10);
        site.basebackup_interval_hours = 1.5;
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 15, 20, 30).unwrap();

        // no backups at all: due, anchored at 14:40
        let stub = get_new_backup_details(now, &site, &[], false).unwrap();
        assert_eq!(stub.reason, BackupReason::Scheduled);
        assert_eq!(stub.decision_time, now);
        assert_eq!(
            stub.normalized_backup_time.as_deref(),
            Some("2024-03-07T14:40:00+00:00")
        );

        // same window already covered: not due
        let backups = vec![entry(
            "2024-03-07T14:20:30+00:00",
            Some("2024-03-07T14:40:00+00:00"),
            "scheduled",
        )];
        assert_eq!(get_new_backup_details(now, &site, &backups, false), None);

        // one hour later the window moved and the interval elapsed: due
        let later = now + Duration::hours(1);
        let stub = get_new_backup_details(later, &site, &backups, false).unwrap();
        assert_eq!(stub.reason, BackupReason::Scheduled);
        assert_eq!(
            stub.normalized_backup_time.as_deref(),
            Some("2024-03-07T16:10:00+00:00")
        );

        // window moved but the interval floor holds the backup back
        site.basebackup_interval_hours = 12.0;
        site.basebackup_hour = Some(14);
        site.basebackup_minute = Some(50);
        assert_eq!(get_new_backup_details(later, &site, &backups, false), None);
    }

    #[test]
    fn manual_trigger_always_wins() {
        let mut site = test_site();
        site.basebackup_hour = Some(13);
        site.basebackup_minute = Some(10);
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 15, 20, 30).unwrap();
        let normalized = normalized_backup_time(&site, now);

        // the current window is covered by a requested backup
        let backups = vec![entry(
            "2024-03-07T15:00:00+00:00",
            normalized.as_deref(),
            "requested",
        )];
        assert_eq!(get_new_backup_details(now, &site, &backups, false), None);

        let stub = get_new_backup_details(now, &site, &backups, true).unwrap();
        assert_eq!(stub.reason, BackupReason::Requested);
        assert_eq!(stub.normalized_backup_time, normalized);
    }

    #[test]
    fn interval_only_sites_use_elapsed_time() {
        let site = test_site();
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 15, 20, 30).unwrap();

        let stub = get_new_backup_details(now, &site, &[], false).unwrap();
        assert_eq!(stub.reason, BackupReason::Scheduled);
        assert_eq!(stub.normalized_backup_time, None);

        let recent = vec![entry("2024-03-07T10:00:00+00:00", None, "scheduled")];
        assert_eq!(get_new_backup_details(now, &site, &recent, false), None);

        let old = vec![entry("2024-03-06T10:00:00+00:00", None, "scheduled")];
        assert!(get_new_backup_details(now, &site, &old, false).is_some());
    }

    #[test]
    fn decision_is_idempotent() {
        let mut site = test_site();
        site.basebackup_hour = Some(13);
        site.basebackup_minute = Some(10);
        site.basebackup_interval_hours = 1.5;
        let now = Utc.with_ymd_and_hms(2024, 3, 7, 15, 20, 30).unwrap();
        let backups = vec![entry(
            "2024-03-07T10:00:00+00:00",
            Some("2024-03-07T11:40:00+00:00"),
            "scheduled",
        )];

        let first = get_new_backup_details(now, &site, &backups, false);
        let second = get_new_backup_details(now, &site, &backups, false);
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    #[test]
    fn delta_cooldown_suppresses_scheduled_attempts() {
        let site = test_site();
        let now = Utc::now();

        assert!(!delta_backups_suppressed(&site, None, now));

        let exhausted = DeltaFailureInfo {
            retries: site.basebackup_delta_mode_max_retries + 1,
            last_failed_time: now,
        };
        assert!(delta_backups_suppressed(&site, Some(&exhausted), now));

        // a full interval after the last failure the cooldown expires
        let stale = DeltaFailureInfo {
            retries: site.basebackup_delta_mode_max_retries + 1,
            last_failed_time: now
                - Duration::hours(site.basebackup_interval_hours as i64)
                - Duration::seconds(5),
        };
        assert!(!delta_backups_suppressed(&site, Some(&stale), now));

        // within budget: no suppression
        let within = DeltaFailureInfo {
            retries: site.basebackup_delta_mode_max_retries,
            last_failed_time: now,
        };
        assert!(!delta_backups_suppressed(&site, Some(&within), now));
    }
}
