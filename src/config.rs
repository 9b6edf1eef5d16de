//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

/// Default per-run stop limit handed to the worker when the caller gives none.
pub const DEFAULT_STOP_LIMIT: u32 = 50;

/// Default HTTP port for the local API.
pub const DEFAULT_PORT: u16 = 3001;

/// How the external worker is launched.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments passed before anything run-specific.
    pub args: Vec<String>,
    /// Base path of the browser bundle the worker drives, if any.
    pub browsers_path: Option<PathBuf>,
    /// Base path of static assets the worker serves, if any.
    pub dist_dir: Option<PathBuf>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "scraper-worker".to_string(),
            args: Vec::new(),
            browsers_path: None,
            dist_dir: None,
        }
    }
}

/// Run supervision timings and limits.
#[derive(Debug, Clone)]
pub struct RunConfigDefaults {
    /// Stop limit merged under caller-supplied launch parameters.
    pub stop_limit: u32,
    /// Window between the graceful stop signal and the forced kill.
    pub grace_period: Duration,
    /// Window `stop()` waits for the worker to halt cooperatively.
    pub settle_period: Duration,
    /// Poll cadence of the status streamer.
    pub stream_interval: Duration,
}

impl Default for RunConfigDefaults {
    fn default() -> Self {
        Self {
            stop_limit: DEFAULT_STOP_LIMIT,
            grace_period: Duration::from_millis(2000),
            settle_period: Duration::from_millis(500),
            stream_interval: Duration::from_millis(1000),
        }
    }
}

/// Startup readiness polling.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Extra health URLs probed alongside the API's own `/health`.
    pub extra_targets: Vec<String>,
    /// Delay between probe rounds.
    pub poll_interval: Duration,
    /// A progress line is logged every this many attempts.
    pub report_every: u32,
    /// Optional upper bound on the wait. `None` waits indefinitely.
    pub max_wait: Option<Duration>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            extra_targets: Vec::new(),
            poll_interval: Duration::from_millis(500),
            report_every: 5,
            max_wait: None,
        }
    }
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root directory holding one directory per run.
    pub runs_dir: PathBuf,
    /// Directory holding persisted state such as the watch job document.
    pub data_dir: PathBuf,
    /// Port of the local HTTP API (also handed to the worker as `PORT`).
    pub port: u16,
    pub worker: WorkerCommand,
    pub run: RunConfigDefaults,
    pub readiness: ReadinessConfig,
    /// How often the watch scheduler looks for due jobs.
    pub watch_tick: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("./runs"),
            data_dir: PathBuf::from("./data"),
            port: DEFAULT_PORT,
            worker: WorkerCommand::default(),
            run: RunConfigDefaults::default(),
            readiness: ReadinessConfig::default(),
            watch_tick: Duration::from_secs(60),
        }
    }
}

impl SupervisorConfig {
    /// Build configuration from `SCRAPER_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let data_dir = std::env::var("SCRAPER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let runs_dir = std::env::var("SCRAPER_RUNS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("runs"));

        let port: u16 = std::env::var("SCRAPER_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let worker = WorkerCommand {
            program: std::env::var("SCRAPER_WORKER_CMD").unwrap_or(defaults.worker.program),
            args: std::env::var("SCRAPER_WORKER_ARGS")
                .unwrap_or_default()
                .split_whitespace()
                .map(String::from)
                .collect(),
            browsers_path: std::env::var("SCRAPER_BROWSERS_PATH").ok().map(PathBuf::from),
            dist_dir: std::env::var("SCRAPER_DIST_DIR").ok().map(PathBuf::from),
        };

        let stop_limit: u32 = std::env::var("SCRAPER_DEFAULT_STOP_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_STOP_LIMIT);

        let extra_targets: Vec<String> = std::env::var("SCRAPER_READY_URLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let max_wait = std::env::var("SCRAPER_READY_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        let watch_tick_secs: u64 = std::env::var("SCRAPER_WATCH_TICK_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        Self {
            runs_dir,
            data_dir,
            port,
            worker,
            run: RunConfigDefaults {
                stop_limit,
                ..RunConfigDefaults::default()
            },
            readiness: ReadinessConfig {
                extra_targets,
                max_wait,
                ..ReadinessConfig::default()
            },
            watch_tick: Duration::from_secs(watch_tick_secs),
        }
    }

    /// Path of the persisted watch job document.
    pub fn watch_jobs_path(&self) -> PathBuf {
        self.data_dir.join("watch_jobs.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_timings() {
        let config = SupervisorConfig::default();
        assert_eq!(config.run.stop_limit, 50);
        assert_eq!(config.run.grace_period, Duration::from_millis(2000));
        assert_eq!(config.run.settle_period, Duration::from_millis(500));
        assert_eq!(config.run.stream_interval, Duration::from_secs(1));
        assert_eq!(config.readiness.poll_interval, Duration::from_millis(500));
        assert_eq!(config.readiness.report_every, 5);
        assert!(config.readiness.max_wait.is_none());
    }

    #[test]
    fn watch_jobs_live_in_data_dir() {
        let config = SupervisorConfig {
            data_dir: PathBuf::from("/var/lib/scraper"),
            ..SupervisorConfig::default()
        };
        assert_eq!(
            config.watch_jobs_path(),
            PathBuf::from("/var/lib/scraper/watch_jobs.json")
        );
    }
}
