//! Single-flight run lifecycle.
//!
//! At most one run is active. Starting a new run tears the previous one down
//! first; stopping is idempotent. Each run gets its own stats cell, so a
//! driver that outlives its run can never write into a newer run's stats.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use super::config::{RunConfig, RunMode};
use super::stats::{RunStats, RunStatus};
use crate::config::RunConfigDefaults;
use crate::error::RunError;
use crate::worker::launcher::{LaunchRequest, StopFlag, WorkerControl, WorkerLauncher};
use crate::worker::protocol::{LogLevel, WorkerEvent};

/// Worker events buffered between the launcher and the run driver.
const EVENT_BUFFER: usize = 256;

/// Point-in-time view of the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: Option<String>,
    pub mode: Option<RunMode>,
    pub stats: RunStats,
    pub stop_limit: u32,
    pub last_error: Option<String>,
}

/// Mutable state of one run, written by its driver.
#[derive(Debug, Default)]
struct RunState {
    stats: RunStats,
    last_error: Option<String>,
}

struct ActiveRun {
    generation: u64,
    run_id: String,
    config: RunConfig,
    stop_limit: u32,
    state: Arc<RwLock<RunState>>,
    stop: StopFlag,
    control: Arc<dyn WorkerControl>,
    driver: JoinHandle<()>,
}

impl ActiveRun {
    async fn snapshot(&self) -> RunSnapshot {
        let state = self.state.read().await;
        RunSnapshot {
            run_id: Some(self.run_id.clone()),
            mode: Some(self.config.mode),
            stats: state.stats.clone(),
            stop_limit: self.stop_limit,
            last_error: state.last_error.clone(),
        }
    }
}

/// Starts, stops and observes worker runs.
pub struct RunSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    defaults: RunConfigDefaults,
    runs_dir: PathBuf,
    /// Serializes start / stop / shutdown.
    lifecycle: Mutex<()>,
    active: Arc<RwLock<Option<ActiveRun>>>,
    last: Arc<RwLock<RunSnapshot>>,
    generation: AtomicU64,
}

impl RunSupervisor {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        defaults: RunConfigDefaults,
        runs_dir: impl Into<PathBuf>,
    ) -> Self {
        let last = RunSnapshot {
            stop_limit: defaults.stop_limit,
            ..RunSnapshot::default()
        };
        Self {
            launcher,
            defaults,
            runs_dir: runs_dir.into(),
            lifecycle: Mutex::new(()),
            active: Arc::new(RwLock::new(None)),
            last: Arc::new(RwLock::new(last)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn defaults(&self) -> &RunConfigDefaults {
        &self.defaults
    }

    /// Start a run, replacing any active one. Returns the run id once the
    /// worker launch is confirmed.
    pub async fn start(&self, config: RunConfig) -> Result<String, RunError> {
        config.validate()?;

        let _guard = self.lifecycle.lock().await;

        let previous = self.active.write().await.take();
        if let Some(previous) = previous {
            tracing::info!(
                run_id = %previous.run_id,
                "Stopping active run before starting a new one"
            );
            self.teardown(previous).await;
        }

        let run_id = config
            .requested_run_id()
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let stop_limit = config.effective_stop_limit(self.defaults.stop_limit);
        let output_dir = config
            .output_dir
            .clone()
            .unwrap_or_else(|| self.runs_dir.join(&run_id));

        let state = Arc::new(RwLock::new(RunState {
            stats: RunStats::running(),
            last_error: None,
        }));
        let stop = StopFlag::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let request = LaunchRequest {
            run_id: run_id.clone(),
            params: config.launch_params(self.defaults.stop_limit),
            output_dir,
            events: events_tx,
            stop: stop.clone(),
        };

        let worker = match self.launcher.launch(request).await {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Worker launch failed");
                *self.last.write().await = RunSnapshot {
                    run_id: Some(run_id),
                    mode: Some(config.mode),
                    stats: RunStats {
                        status: RunStatus::Error,
                        ..RunStats::default()
                    },
                    stop_limit,
                    last_error: Some(e.to_string()),
                };
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut slot = self.active.write().await;
        let driver = tokio::spawn(drive_run(RunDriver {
            generation,
            run_id: run_id.clone(),
            state: Arc::clone(&state),
            stop: stop.clone(),
            events: events_rx,
            completion: worker.completion,
            active: Arc::clone(&self.active),
            last: Arc::clone(&self.last),
        }));

        tracing::info!(
            run_id = %run_id,
            mode = %config.mode,
            target = %config.target_url,
            stop_limit,
            "Run started"
        );

        *slot = Some(ActiveRun {
            generation,
            run_id: run_id.clone(),
            config,
            stop_limit,
            state,
            stop,
            control: worker.control,
            driver,
        });

        Ok(run_id)
    }

    /// Ask the active run to stop. Returns `false` when nothing was running.
    pub async fn stop(&self) -> bool {
        let _guard = self.lifecycle.lock().await;

        let (generation, run_id, state, stop, control) = {
            let slot = self.active.read().await;
            let Some(run) = slot.as_ref() else {
                return false;
            };
            (
                run.generation,
                run.run_id.clone(),
                Arc::clone(&run.state),
                run.stop.clone(),
                Arc::clone(&run.control),
            )
        };

        tracing::info!(run_id = %run_id, "Stop requested");
        stop.raise();
        control.request_stop();

        tokio::time::sleep(self.defaults.settle_period).await;

        state.write().await.stats.finish(RunStatus::Stopped);

        let taken = {
            let mut slot = self.active.write().await;
            let ours = slot
                .as_ref()
                .is_some_and(|run| run.generation == generation);
            if ours { slot.take() } else { None }
        };

        if let Some(run) = taken {
            *self.last.write().await = run.snapshot().await;

            if !run.driver.is_finished() {
                let grace = self.defaults.grace_period;
                tokio::spawn(async move {
                    tracing::debug!(run_id = %run.run_id, "Worker still running after stop, terminating");
                    run.control.terminate();
                    // Termination escalates to a kill after `grace`.
                    if tokio::time::timeout(grace * 2, run.driver).await.is_err() {
                        tracing::warn!(run_id = %run.run_id, "Stopped worker has not exited");
                    }
                });
            }
        }

        tracing::info!(run_id = %run_id, "Run stopped");
        true
    }

    /// Stats of the active run, else of the last run, else idle zeros.
    pub async fn get_stats(&self) -> RunStats {
        self.snapshot().await.stats
    }

    pub async fn snapshot(&self) -> RunSnapshot {
        let state = {
            let slot = self.active.read().await;
            slot.as_ref().map(|run| {
                (
                    run.run_id.clone(),
                    run.config.mode,
                    run.stop_limit,
                    Arc::clone(&run.state),
                )
            })
        };

        match state {
            Some((run_id, mode, stop_limit, state)) => {
                let state = state.read().await;
                RunSnapshot {
                    run_id: Some(run_id),
                    mode: Some(mode),
                    stats: state.stats.clone(),
                    stop_limit,
                    last_error: state.last_error.clone(),
                }
            }
            None => self.last.read().await.clone(),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Stop and terminate the active run. Used by host shutdown.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let previous = self.active.write().await.take();
        if let Some(previous) = previous {
            tracing::info!(run_id = %previous.run_id, "Shutting down active run");
            self.teardown(previous).await;
        }
    }

    /// Freeze a run as stopped, terminate its worker and wait up to the grace
    /// window for its driver to finish.
    async fn teardown(&self, run: ActiveRun) {
        run.stop.raise();
        run.state.write().await.stats.finish(RunStatus::Stopped);
        run.control.terminate();

        *self.last.write().await = run.snapshot().await;

        let run_id = run.run_id;
        if tokio::time::timeout(self.defaults.grace_period, run.driver)
            .await
            .is_err()
        {
            tracing::warn!(run_id = %run_id, "Previous worker did not finish within the grace window");
        }
    }
}

struct RunDriver {
    generation: u64,
    run_id: String,
    state: Arc<RwLock<RunState>>,
    stop: StopFlag,
    events: mpsc::Receiver<WorkerEvent>,
    completion: BoxFuture<'static, Result<(), RunError>>,
    active: Arc<RwLock<Option<ActiveRun>>>,
    last: Arc<RwLock<RunSnapshot>>,
}

/// Apply worker events in receipt order until the worker finishes, then
/// settle the final status and release the slot if it still belongs to us.
async fn drive_run(driver: RunDriver) {
    let RunDriver {
        generation,
        run_id,
        state,
        stop,
        mut events,
        mut completion,
        active,
        last,
    } = driver;

    let outcome = loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => apply_event(&run_id, &state, event).await,
            outcome = &mut completion => break outcome,
        }
    };
    while let Ok(event) = events.try_recv() {
        apply_event(&run_id, &state, event).await;
    }

    {
        let mut state = state.write().await;
        match outcome {
            _ if stop.is_raised() => {
                state.stats.finish(RunStatus::Stopped);
            }
            Ok(()) => {
                if state.stats.finish(RunStatus::Completed) {
                    tracing::info!(
                        run_id = %run_id,
                        total_scanned = state.stats.total_scanned,
                        success = state.stats.success,
                        failed = state.stats.failed,
                        "Run completed"
                    );
                }
            }
            Err(e) => {
                if state.stats.finish(RunStatus::Error) {
                    tracing::error!(run_id = %run_id, error = %e, "Run failed");
                    state.last_error = Some(e.to_string());
                }
            }
        }
    }

    let mut slot = active.write().await;
    let ours = slot
        .as_ref()
        .is_some_and(|run| run.generation == generation);
    if ours {
        if let Some(run) = slot.take() {
            *last.write().await = run.snapshot().await;
        }
    }
}

async fn apply_event(run_id: &str, state: &RwLock<RunState>, event: WorkerEvent) {
    match event {
        WorkerEvent::Stats(update) => {
            let mut state = state.write().await;
            if !state.stats.apply(&update) {
                tracing::debug!(run_id = %run_id, "Stats update after terminal status ignored");
            }
        }
        WorkerEvent::Log(entry) => match entry.level {
            LogLevel::Debug => tracing::debug!(run_id = %run_id, "{}", entry.message),
            LogLevel::Info => tracing::info!(run_id = %run_id, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(run_id = %run_id, "{}", entry.message),
            LogLevel::Error => tracing::error!(run_id = %run_id, "{}", entry.message),
        },
    }
}
