//! Live status streaming.
//!
//! Each subscriber gets its own poller task that samples the supervisor's
//! snapshot on a fixed cadence. The poller ends when the run reaches
//! `completed` or `error`, or as soon as the subscriber drops its stream.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::stats::{RunStats, RunStatus};
use super::supervisor::{RunSnapshot, RunSupervisor};
use crate::worker::protocol::{LogEntry, LogLevel};

const SUBSCRIBER_BUFFER: usize = 16;

/// Message attached to a failed run that left no error of its own.
const UNSPECIFIED_FAILURE: &str = "Stopped or Failed";

/// Terminal summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneSummary {
    pub success: bool,
    pub summary: RunStats,
    pub error: Option<String>,
}

/// One event on a status stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected { run_id: String },
    Log(LogEntry),
    Progress { percentage: f64 },
    Stats(RunSnapshot),
    Done(DoneSummary),
}

impl StreamEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Log(_) => "log",
            Self::Progress { .. } => "progress",
            Self::Stats(_) => "stats",
            Self::Done(_) => "done",
        }
    }

    /// JSON payload on the wire.
    pub fn data(&self) -> Value {
        match self {
            Self::Connected { run_id } => json!({ "runId": run_id }),
            Self::Log(entry) => json!(entry),
            Self::Progress { percentage } => json!({ "percentage": percentage }),
            Self::Stats(snapshot) => json!(snapshot),
            Self::Done(done) => json!(done),
        }
    }
}

/// Progress towards the stop limit, capped at 100.
pub fn progress_percentage(stats: &RunStats, stop_limit: u32) -> f64 {
    if stop_limit == 0 {
        return 0.0;
    }
    (stats.total_scanned as f64 / f64::from(stop_limit) * 100.0).min(100.0)
}

fn done_summary(snapshot: &RunSnapshot) -> Option<DoneSummary> {
    match snapshot.stats.status {
        RunStatus::Completed => Some(DoneSummary {
            success: true,
            summary: snapshot.stats.clone(),
            error: None,
        }),
        RunStatus::Error => Some(DoneSummary {
            success: false,
            summary: snapshot.stats.clone(),
            error: Some(
                snapshot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| UNSPECIFIED_FAILURE.to_string()),
            ),
        }),
        _ => None,
    }
}

/// Fans the supervisor's snapshot out to live subscribers.
#[derive(Clone)]
pub struct StatusStreamer {
    supervisor: Arc<RunSupervisor>,
    interval: Duration,
}

impl StatusStreamer {
    pub fn new(supervisor: Arc<RunSupervisor>, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
        }
    }

    /// Open a status stream labelled with `run_id`.
    pub fn subscribe(&self, run_id: impl Into<String>) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(poll_status(
            Arc::clone(&self.supervisor),
            self.interval,
            run_id.into(),
            tx,
        ));
        ReceiverStream::new(rx)
    }
}

async fn poll_status(
    supervisor: Arc<RunSupervisor>,
    interval: Duration,
    run_id: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    let greeting = [
        StreamEvent::Connected {
            run_id: run_id.clone(),
        },
        StreamEvent::Log(LogEntry::new(
            LogLevel::Info,
            format!("Connected to status stream for run {run_id}"),
        )),
    ];
    for event in greeting {
        if tx.send(event).await.is_err() {
            return;
        }
    }
    tracing::debug!(run_id = %run_id, "Status subscriber connected");

    let mut ticker = tokio::time::interval(interval);
    // Skip immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tx.closed() => {
                tracing::debug!(run_id = %run_id, "Status subscriber disconnected");
                return;
            }
            _ = ticker.tick() => {}
        }

        let snapshot = supervisor.snapshot().await;
        let done = done_summary(&snapshot);
        let events = [
            Some(StreamEvent::Progress {
                percentage: progress_percentage(&snapshot.stats, snapshot.stop_limit),
            }),
            Some(StreamEvent::Stats(snapshot)),
            done.clone().map(StreamEvent::Done),
        ];

        for event in events.into_iter().flatten() {
            if tx.send(event).await.is_err() {
                return;
            }
        }

        if done.is_some() {
            tracing::debug!(run_id = %run_id, "Run finished, closing status stream");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::run::config::RunConfig;
    use crate::run::stats::StatsUpdate;
    use crate::run::supervisor::testing::*;
    use crate::worker::launcher::WorkerLauncher;

    fn setup() -> (Arc<FakeLauncher>, Arc<RunSupervisor>, StatusStreamer) {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = Arc::new(RunSupervisor::new(
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            fast_defaults(),
            "/tmp/runs",
        ));
        let streamer = StatusStreamer::new(Arc::clone(&supervisor), Duration::from_millis(20));
        (launcher, supervisor, streamer)
    }

    #[test]
    fn percentage_is_capped() {
        let stats = RunStats {
            total_scanned: 80,
            ..RunStats::running()
        };
        assert_eq!(progress_percentage(&stats, 50), 100.0);
        assert_eq!(progress_percentage(&stats, 160), 50.0);
        assert_eq!(progress_percentage(&stats, 0), 0.0);
    }

    #[test]
    fn wire_names_and_payloads() {
        let event = StreamEvent::Connected {
            run_id: "r1".into(),
        };
        assert_eq!(event.name(), "connected");
        assert_eq!(event.data(), json!({"runId": "r1"}));

        let done = StreamEvent::Done(DoneSummary {
            success: false,
            summary: RunStats::default(),
            error: Some("boom".into()),
        });
        assert_eq!(done.name(), "done");
        assert_eq!(done.data()["error"], "boom");
        assert_eq!(done.data()["summary"]["totalScanned"], 0);
    }

    #[tokio::test]
    async fn completed_run_ends_with_done() {
        let (launcher, supervisor, streamer) = setup();
        supervisor
            .start(RunConfig::new("https://example.com"))
            .await
            .unwrap();
        let worker = launcher.worker(0);
        worker
            .stats(StatsUpdate {
                total_scanned: Some(25),
                success: Some(25),
                ..Default::default()
            })
            .await;
        worker.succeed();
        let sup = &supervisor;
        eventually(|| async move { !sup.is_running().await }).await;

        let events: Vec<StreamEvent> = tokio::time::timeout(
            Duration::from_secs(2),
            streamer.subscribe("r1").collect(),
        )
        .await
        .unwrap();

        let names: Vec<&str> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(names, ["connected", "log", "progress", "stats", "done"]);
        assert_eq!(events[2], StreamEvent::Progress { percentage: 50.0 });
        match &events[4] {
            StreamEvent::Done(done) => {
                assert!(done.success);
                assert_eq!(done.error, None);
                assert_eq!(done.summary.success, 25);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_run_reports_error() {
        let (launcher, supervisor, streamer) = setup();
        supervisor
            .start(RunConfig::new("https://example.com"))
            .await
            .unwrap();
        launcher.worker(0).fail("navigation timeout");
        let sup = &supervisor;
        eventually(|| async move { !sup.is_running().await }).await;

        let events: Vec<StreamEvent> = tokio::time::timeout(
            Duration::from_secs(2),
            streamer.subscribe("r1").collect(),
        )
        .await
        .unwrap();

        match events.last() {
            Some(StreamEvent::Done(done)) => {
                assert!(!done.success);
                assert!(done.error.as_deref().unwrap().contains("navigation timeout"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn running_run_keeps_streaming() {
        let (_launcher, supervisor, streamer) = setup();
        supervisor
            .start(RunConfig::new("https://example.com"))
            .await
            .unwrap();

        let mut stream = streamer.subscribe("r1");
        let mut names = Vec::new();
        for _ in 0..6 {
            let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap()
                .unwrap();
            names.push(event.name());
        }
        assert_eq!(
            names,
            ["connected", "log", "progress", "stats", "progress", "stats"]
        );
    }

    #[tokio::test]
    async fn disconnect_stops_poller() {
        let (_launcher, supervisor, streamer) = setup();
        supervisor
            .start(RunConfig::new("https://example.com"))
            .await
            .unwrap();

        let mut stream = streamer.subscribe("r1");
        stream.next().await.unwrap();
        // Held by the test, the streamer and the poller.
        assert_eq!(Arc::strong_count(&supervisor), 3);

        drop(stream);
        let sup = &supervisor;
        eventually(|| async move { Arc::strong_count(sup) == 2 }).await;
    }
}
