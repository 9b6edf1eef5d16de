//! Worker launch seam.
//!
//! The run supervisor only sees [`WorkerLauncher`]: it hands over the merged
//! launch parameters plus an event channel and a stop flag, and gets back a
//! control handle and a completion future. [`ProcessLauncher`] backs this with
//! an external OS process; tests and embedders can plug in-process workers.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc};

use super::process::{ChildProcessSupervisor, ProcessSpec, ProcessTerminator, write_line};
use super::protocol::{STOP_COMMAND, WorkerEvent, parse_line};
use crate::config::WorkerCommand;
use crate::error::RunError;

/// How long a finished worker's remaining output may take to drain.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared cooperative-stop flag. In-process workers poll it.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a worker needs to start one run.
pub struct LaunchRequest {
    pub run_id: String,
    /// Defaults merged with caller overrides.
    pub params: serde_json::Map<String, serde_json::Value>,
    pub output_dir: PathBuf,
    pub events: mpsc::Sender<WorkerEvent>,
    pub stop: StopFlag,
}

/// Out-of-band control over a launched worker.
pub trait WorkerControl: Send + Sync {
    /// Ask the worker to halt cooperatively. The stop flag is already raised.
    fn request_stop(&self);

    /// OS-level terminate with forced-kill escalation.
    fn terminate(&self);
}

/// A worker that has been started.
pub struct LaunchedWorker {
    pub control: Arc<dyn WorkerControl>,
    /// Resolves when the worker is done; `Err` when it failed.
    pub completion: BoxFuture<'static, Result<(), RunError>>,
}

/// Starts workers for the run supervisor.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedWorker, RunError>;
}

/// Launches the worker as an external process.
pub struct ProcessLauncher {
    supervisor: Arc<ChildProcessSupervisor>,
    command: WorkerCommand,
    port: u16,
}

impl ProcessLauncher {
    pub fn new(supervisor: Arc<ChildProcessSupervisor>, command: WorkerCommand, port: u16) -> Self {
        Self {
            supervisor,
            command,
            port,
        }
    }

    fn spec(&self, request: &LaunchRequest) -> ProcessSpec {
        let params = serde_json::Value::Object(request.params.clone()).to_string();
        let mut spec = ProcessSpec::new(&self.command.program)
            .args(self.command.args.iter().cloned())
            .env("SCRAPER_RUN_ID", &request.run_id)
            .env("SCRAPER_OUTPUT_DIR", request.output_dir.to_string_lossy())
            .env("SCRAPER_RUN_CONFIG", params)
            .env("PORT", self.port.to_string());
        if let Some(ref path) = self.command.browsers_path {
            spec = spec.env("SCRAPER_BROWSERS_PATH", path.to_string_lossy());
        }
        if let Some(ref path) = self.command.dist_dir {
            spec = spec.env("SCRAPER_DIST_DIR", path.to_string_lossy());
        }
        spec
    }
}

struct ProcessControl {
    stop: Arc<Notify>,
    terminator: ProcessTerminator,
}

impl WorkerControl for ProcessControl {
    fn request_stop(&self) {
        self.stop.notify_one();
    }

    fn terminate(&self) {
        self.terminator.terminate();
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedWorker, RunError> {
        let run_id = request.run_id.clone();
        let launch_failed = |reason: String| RunError::LaunchFailed {
            run_id: run_id.clone(),
            reason,
        };

        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| {
                launch_failed(format!(
                    "cannot create output dir {}: {e}",
                    request.output_dir.display()
                ))
            })?;

        let mut handle = self
            .supervisor
            .spawn(self.spec(&request))
            .await
            .map_err(|e| launch_failed(e.to_string()))?;

        let mut output = handle
            .take_output()
            .ok_or_else(|| launch_failed("worker output already taken".to_string()))?;
        let events = request.events;
        let pump = tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                if let Some(event) = parse_line(&line) {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        let stop = Arc::new(Notify::new());
        let control = Arc::new(ProcessControl {
            stop: Arc::clone(&stop),
            terminator: handle.terminator(),
        });

        let mut stdin = handle.take_stdin();
        let completion = async move {
            let wait = handle.wait();
            tokio::pin!(wait);

            let report = loop {
                tokio::select! {
                    report = &mut wait => break report,
                    _ = stop.notified(), if stdin.is_some() => {
                        if let Some(mut pipe) = stdin.take() {
                            if let Err(e) = write_line(&mut pipe, STOP_COMMAND).await {
                                tracing::debug!(run_id = %run_id, error = %e, "Stop command not delivered");
                            }
                        }
                    }
                }
            };

            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await.is_err() {
                tracing::warn!(run_id = %run_id, "Worker output did not drain after exit");
            }

            if report.success() {
                Ok(())
            } else {
                Err(RunError::WorkerFailed {
                    run_id,
                    reason: format!("worker ended with {report}"),
                })
            }
        };

        Ok(LaunchedWorker {
            control,
            completion: Box::pin(completion),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::run::stats::{RunStatus, StatsUpdate};
    use crate::worker::protocol::{LogEntry, LogLevel};

    fn launcher(script: &str) -> ProcessLauncher {
        ProcessLauncher::new(
            Arc::new(ChildProcessSupervisor::new(Duration::from_millis(500))),
            WorkerCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                ..WorkerCommand::default()
            },
            3001,
        )
    }

    fn request(dir: &std::path::Path, events: mpsc::Sender<WorkerEvent>) -> LaunchRequest {
        let mut params = serde_json::Map::new();
        params.insert("stopLimit".into(), serde_json::json!(7));
        LaunchRequest {
            run_id: "run-1".to_string(),
            params,
            output_dir: dir.join("out"),
            events,
            stop: StopFlag::new(),
        }
    }

    #[tokio::test]
    async fn forwards_events_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let script = r#"echo "{\"event\":\"stats\",\"data\":{\"totalScanned\":3}}"; echo "$SCRAPER_RUN_ID $PORT $SCRAPER_RUN_CONFIG""#;

        let worker = launcher(script).launch(request(dir.path(), tx)).await.unwrap();
        worker.completion.await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(WorkerEvent::Stats(StatsUpdate {
                total_scanned: Some(3),
                ..Default::default()
            }))
        );
        assert_eq!(
            rx.recv().await,
            Some(WorkerEvent::Log(LogEntry::new(
                LogLevel::Info,
                r#"run-1 3001 {"stopLimit":7}"#
            )))
        );
        assert!(dir.path().join("out").is_dir());
    }

    #[tokio::test]
    async fn cooperative_stop_over_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let script = r#"read cmd; echo "{\"event\":\"stats\",\"data\":{\"status\":\"stopped\"}}""#;

        let worker = launcher(script).launch(request(dir.path(), tx)).await.unwrap();
        worker.control.request_stop();
        worker.completion.await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(WorkerEvent::Stats(StatsUpdate {
                status: Some(RunStatus::Stopped),
                ..Default::default()
            }))
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_worker_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(16);

        let worker = launcher("exit 4").launch(request(dir.path(), tx)).await.unwrap();
        let err = worker.completion.await.unwrap_err();
        assert!(matches!(err, RunError::WorkerFailed { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let launcher = ProcessLauncher::new(
            Arc::new(ChildProcessSupervisor::new(Duration::from_millis(500))),
            WorkerCommand {
                program: "/no/such/worker".to_string(),
                ..WorkerCommand::default()
            },
            3001,
        );

        let err = launcher.launch(request(dir.path(), tx)).await.err().unwrap();
        assert!(matches!(err, RunError::LaunchFailed { .. }));
    }
}
