//! Persisted watch job types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_INTERVAL_MINUTES: u32 = 30;
pub const DEFAULT_JOB_NAME: &str = "New Watch Job";

/// Counters accumulated over a job's runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchJobStats {
    pub total_runs: u64,
    pub total_items_found: u64,
}

/// A recurring run of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchJob {
    pub id: String,
    pub target_url: String,
    pub interval_minutes: u32,
    pub name: String,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: WatchJobStats,
}

impl WatchJob {
    /// Build an enabled job from caller input, validated and defaulted.
    pub fn create(input: NewWatchJob, now: DateTime<Utc>) -> Result<Self, ConfigError> {
        let target_url = input
            .target_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "targetUrl".to_string(),
                hint: "A watch job needs a target to scrape.".to_string(),
            })?
            .to_string();

        let interval_minutes = input
            .interval_minutes
            .filter(|minutes| *minutes > 0)
            .unwrap_or(DEFAULT_INTERVAL_MINUTES);

        let name = input
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_JOB_NAME.to_string());

        let mut job = Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_url,
            interval_minutes,
            name,
            is_enabled: true,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: now,
            stats: WatchJobStats::default(),
        };
        job.reschedule();
        Ok(job)
    }

    /// `nextRunAt = (lastRunAt ?? createdAt) + interval`.
    pub fn reschedule(&mut self) {
        let base = self.last_run_at.unwrap_or(self.created_at);
        self.next_run_at = base + Duration::minutes(i64::from(self.interval_minutes));
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled && self.next_run_at <= now
    }

    /// Run id used when the scheduler fires this job.
    pub fn run_id_at(&self, at: DateTime<Utc>) -> String {
        format!("watch_{}_{}", self.id, at.timestamp_millis())
    }
}

/// Caller input for a new watch job.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWatchJob {
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn create_applies_defaults() {
        let job = WatchJob::create(
            NewWatchJob {
                target_url: Some("https://example.com/deals".into()),
                ..Default::default()
            },
            now(),
        )
        .unwrap();

        assert_eq!(job.interval_minutes, 30);
        assert_eq!(job.name, "New Watch Job");
        assert!(job.is_enabled);
        assert_eq!(job.stats, WatchJobStats::default());
        assert_eq!(job.next_run_at, now() + Duration::minutes(30));
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        let job = WatchJob::create(
            NewWatchJob {
                target_url: Some("https://example.com".into()),
                interval_minutes: Some(0),
                name: Some("  ".into()),
            },
            now(),
        )
        .unwrap();
        assert_eq!(job.interval_minutes, 30);
        assert_eq!(job.name, "New Watch Job");
    }

    #[test]
    fn missing_target_is_a_config_error() {
        let err = WatchJob::create(NewWatchJob::default(), now()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn due_only_when_enabled_and_past_next_run() {
        let mut job = WatchJob::create(
            NewWatchJob {
                target_url: Some("https://example.com".into()),
                interval_minutes: Some(10),
                ..Default::default()
            },
            now(),
        )
        .unwrap();

        assert!(!job.is_due(now()));
        assert!(job.is_due(now() + Duration::minutes(10)));
        job.is_enabled = false;
        assert!(!job.is_due(now() + Duration::minutes(10)));
    }

    #[test]
    fn reschedule_uses_last_run() {
        let mut job = WatchJob::create(
            NewWatchJob {
                target_url: Some("https://example.com".into()),
                interval_minutes: Some(15),
                ..Default::default()
            },
            now(),
        )
        .unwrap();
        job.last_run_at = Some(now() + Duration::hours(2));
        job.reschedule();
        assert_eq!(job.next_run_at, now() + Duration::minutes(135));
    }

    #[test]
    fn wire_format_is_camel_case() {
        let job = WatchJob::create(
            NewWatchJob {
                target_url: Some("https://example.com".into()),
                ..Default::default()
            },
            now(),
        )
        .unwrap();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["intervalMinutes"], 30);
        assert_eq!(json["isEnabled"], true);
        assert_eq!(json["stats"]["totalRuns"], 0);
        assert!(json["lastRunAt"].is_null());
        assert_eq!(job.run_id_at(now()), format!("watch_{}_{}", job.id, now().timestamp_millis()));
    }
}
