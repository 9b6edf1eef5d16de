//! Watch job persistence.
//!
//! All jobs live in one pretty-printed JSON array. Every mutation reads the
//! whole document, changes it and writes it back through a temp file plus
//! rename. Mutations within this process are serialized; separate processes
//! sharing the file can still race.
//!
//! Reads tolerate a damaged document and see no jobs. Mutations refuse to
//! touch it, so a bad file is never replaced by a smaller one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::model::{NewWatchJob, WatchJob};
use crate::error::{ConfigError, StoreError};

pub struct WatchJobStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl WatchJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Vec<WatchJob> {
        self.load().await
    }

    pub async fn get(&self, id: &str) -> Option<WatchJob> {
        self.load().await.into_iter().find(|job| job.id == id)
    }

    pub async fn create(&self, input: NewWatchJob) -> Result<WatchJob, StoreError> {
        let job = WatchJob::create(input, Utc::now())?;

        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load_for_update().await?;
        jobs.push(job.clone());
        self.save(&jobs).await?;

        tracing::info!(job_id = %job.id, target = %job.target_url, interval = job.interval_minutes, "Watch job created");
        Ok(job)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<WatchJob, StoreError> {
        let job = self
            .mutate(id, |job| {
                job.is_enabled = enabled;
            })
            .await?;
        tracing::info!(job_id = %id, enabled, "Watch job toggled");
        Ok(job)
    }

    pub async fn update_interval(&self, id: &str, minutes: u32) -> Result<WatchJob, StoreError> {
        if minutes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "intervalMinutes".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }
        self.mutate(id, |job| {
            job.interval_minutes = minutes;
            job.reschedule();
        })
        .await
    }

    /// Note a run of the job: bumps the run counter and moves `nextRunAt`.
    pub async fn record_run(&self, id: &str, at: DateTime<Utc>) -> Result<WatchJob, StoreError> {
        self.mutate(id, |job| {
            job.last_run_at = Some(at);
            job.stats.total_runs += 1;
            job.reschedule();
        })
        .await
    }

    /// Credit the items a finished run of the job found.
    pub async fn record_items(&self, id: &str, items_found: u64) -> Result<WatchJob, StoreError> {
        self.mutate(id, |job| {
            job.stats.total_items_found += items_found;
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load_for_update().await?;
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        if jobs.len() == before {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        self.save(&jobs).await?;

        tracing::info!(job_id = %id, "Watch job deleted");
        Ok(())
    }

    /// Enabled jobs whose next run is at or before `now`.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Vec<WatchJob> {
        self.load()
            .await
            .into_iter()
            .filter(|job| job.is_due(now))
            .collect()
    }

    async fn mutate<F>(&self, id: &str, change: F) -> Result<WatchJob, StoreError>
    where
        F: FnOnce(&mut WatchJob),
    {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.load_for_update().await?;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        change(job);
        job.updated_at = Utc::now();
        let updated = job.clone();

        self.save(&jobs).await?;
        Ok(updated)
    }

    /// Missing or unreadable documents read as an empty list.
    async fn load(&self) -> Vec<WatchJob> {
        match self.load_for_update().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Watch jobs unavailable");
                Vec::new()
            }
        }
    }

    /// Only a missing or blank document counts as empty.
    async fn load_for_update(&self) -> Result<Vec<WatchJob>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, jobs: &[WatchJob]) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let body = serde_json::to_string_pretty(jobs)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)?;
        Ok(())
    }
}
