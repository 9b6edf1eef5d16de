//! Fires due watch jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::model::WatchJob;
use super::store::WatchJobStore;
use crate::run::{RunConfig, RunMode, RunSupervisor};

/// A fired watch run whose found items are not yet credited to its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWatchRun {
    pub job_id: String,
    pub run_id: String,
}

/// Start at most one due job. Returns the started run.
///
/// Only one run can be active, so a tick that finds the supervisor busy does
/// nothing and remaining due jobs wait for a later tick. The job is recorded
/// as run before the launch so a slow or failed start never fires it twice.
pub async fn check_due_jobs(
    store: &WatchJobStore,
    supervisor: &RunSupervisor,
    now: DateTime<Utc>,
) -> Option<PendingWatchRun> {
    let due = store.due_jobs(now).await;
    if due.is_empty() {
        return None;
    }

    if supervisor.is_running().await {
        tracing::debug!(due = due.len(), "Run in progress, deferring due watch jobs");
        return None;
    }

    let job = oldest_due(due)?;
    if let Err(e) = store.record_run(&job.id, now).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to record watch run");
        return None;
    }

    let config = RunConfig::new(job.target_url.clone())
        .with_mode(RunMode::Watch)
        .with_run_id(job.run_id_at(now));

    match supervisor.start(config).await {
        Ok(run_id) => {
            tracing::info!(job_id = %job.id, name = %job.name, run_id = %run_id, "Watch job fired");
            Some(PendingWatchRun {
                job_id: job.id,
                run_id,
            })
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "Watch job failed to start");
            None
        }
    }
}

/// Credit a finished watch run's successful items to its job.
///
/// Returns `false` while the run is still going. A run that was replaced by
/// another before finishing is settled without credit.
pub async fn settle_watch_run(
    store: &WatchJobStore,
    supervisor: &RunSupervisor,
    run: &PendingWatchRun,
) -> bool {
    let snapshot = supervisor.snapshot().await;
    if snapshot.run_id.as_deref() != Some(run.run_id.as_str()) {
        tracing::debug!(job_id = %run.job_id, run_id = %run.run_id, "Watch run replaced before finishing");
        return true;
    }
    if !snapshot.stats.is_terminal() {
        return false;
    }

    match store.record_items(&run.job_id, snapshot.stats.success).await {
        Ok(job) => tracing::info!(
            job_id = %run.job_id,
            run_id = %run.run_id,
            status = %snapshot.stats.status,
            items = snapshot.stats.success,
            total_items = job.stats.total_items_found,
            "Watch run settled"
        ),
        Err(e) => {
            tracing::warn!(job_id = %run.job_id, error = %e, "Failed to record watch run items")
        }
    }
    true
}

fn oldest_due(jobs: Vec<WatchJob>) -> Option<WatchJob> {
    jobs.into_iter().min_by_key(|job| job.next_run_at)
}

/// Spawn the watch ticker background task.
pub fn spawn_watch_ticker(
    store: Arc<WatchJobStore>,
    supervisor: Arc<RunSupervisor>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        let mut pending: Option<PendingWatchRun> = None;
        loop {
            ticker.tick().await;
            let settled = match &pending {
                Some(run) => settle_watch_run(&store, &supervisor, run).await,
                None => false,
            };
            if settled {
                pending = None;
            }
            if let Some(run) = check_due_jobs(&store, &supervisor, Utc::now()).await {
                pending = Some(run);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::run::StatsUpdate;
    use crate::run::supervisor::testing::*;
    use crate::watch::model::NewWatchJob;
    use crate::worker::launcher::WorkerLauncher;

    fn setup(dir: &std::path::Path) -> (Arc<FakeLauncher>, RunSupervisor, WatchJobStore) {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = RunSupervisor::new(
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            fast_defaults(),
            dir.join("runs"),
        );
        let store = WatchJobStore::new(dir.join("watch_jobs.json"));
        (launcher, supervisor, store)
    }

    fn input(url: &str) -> NewWatchJob {
        NewWatchJob {
            target_url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn nothing_due_nothing_started() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, supervisor, store) = setup(dir.path());
        store.create(input("https://example.com")).await.unwrap();

        assert_eq!(check_due_jobs(&store, &supervisor, Utc::now()).await, None);
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn due_job_starts_watch_run() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, supervisor, store) = setup(dir.path());
        let job = store.create(input("https://example.com/deals")).await.unwrap();

        let now = job.next_run_at + ChronoDuration::seconds(1);
        let run = check_due_jobs(&store, &supervisor, now).await.unwrap();
        assert_eq!(run.job_id, job.id);
        assert_eq!(run.run_id, format!("watch_{}_{}", job.id, now.timestamp_millis()));

        let worker = launcher.worker(0);
        assert_eq!(worker.params["mode"], "watch");
        assert_eq!(worker.params["targetUrl"], "https://example.com/deals");

        let recorded = store.get(&job.id).await.unwrap();
        assert_eq!(recorded.stats.total_runs, 1);
        assert_eq!(recorded.last_run_at, Some(now));
        assert!(!recorded.is_due(now));
    }

    #[tokio::test]
    async fn busy_supervisor_defers() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, supervisor, store) = setup(dir.path());
        let job = store.create(input("https://example.com")).await.unwrap();
        supervisor
            .start(RunConfig::new("https://example.com/manual"))
            .await
            .unwrap();

        let now = job.next_run_at;
        assert_eq!(check_due_jobs(&store, &supervisor, now).await, None);
        assert_eq!(launcher.launches(), 1);
        assert_eq!(store.get(&job.id).await.unwrap().stats.total_runs, 0);
    }

    #[tokio::test]
    async fn failed_start_still_reschedules() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, supervisor, store) = setup(dir.path());
        launcher
            .fail_launch
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let job = store.create(input("https://example.com")).await.unwrap();

        let now = job.next_run_at;
        assert_eq!(check_due_jobs(&store, &supervisor, now).await, None);
        assert!(store.due_jobs(now).await.is_empty());
    }

    #[tokio::test]
    async fn finished_run_credits_found_items() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, supervisor, store) = setup(dir.path());
        let (supervisor, store) = (&supervisor, &store);
        let job = store.create(input("https://example.com")).await.unwrap();

        let run = check_due_jobs(store, supervisor, job.next_run_at).await.unwrap();
        let worker = launcher.worker(0);
        worker
            .stats(StatsUpdate {
                total_scanned: Some(9),
                success: Some(7),
                ..Default::default()
            })
            .await;
        assert!(!settle_watch_run(store, supervisor, &run).await);

        worker.succeed();
        eventually(|| async move { !supervisor.is_running().await }).await;
        assert!(settle_watch_run(store, supervisor, &run).await);

        let job = store.get(&job.id).await.unwrap();
        assert_eq!(job.stats.total_runs, 1);
        assert_eq!(job.stats.total_items_found, 7);
    }

    #[tokio::test]
    async fn replaced_run_credits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (launcher, supervisor, store) = setup(dir.path());
        let job = store.create(input("https://example.com")).await.unwrap();

        let run = check_due_jobs(&store, &supervisor, job.next_run_at).await.unwrap();
        launcher
            .worker(0)
            .stats(StatsUpdate {
                success: Some(3),
                ..Default::default()
            })
            .await;
        supervisor
            .start(RunConfig::new("https://example.com/manual"))
            .await
            .unwrap();

        assert!(settle_watch_run(&store, &supervisor, &run).await);
        assert_eq!(store.get(&job.id).await.unwrap().stats.total_items_found, 0);
    }
}
