//! Startup readiness gate.
//!
//! Polls a set of HTTP health endpoints until every one of them answers with a
//! 2xx status in the same round.

use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::config::ReadinessConfig;
use crate::error::ReadinessError;

/// Upper bound on a single probe request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Waits until the API and its companion services are reachable.
pub struct ReadinessGate {
    client: reqwest::Client,
    targets: Vec<reqwest::Url>,
    poll_interval: Duration,
    report_every: u32,
    max_wait: Option<Duration>,
}

impl ReadinessGate {
    pub fn new<I, S>(targets: I, config: &ReadinessConfig) -> Result<Self, ReadinessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets = targets
            .into_iter()
            .map(|target| parse_target(target.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            client: reqwest::Client::new(),
            targets,
            poll_interval: config.poll_interval,
            report_every: config.report_every.max(1),
            max_wait: config.max_wait,
        })
    }

    pub fn targets(&self) -> &[reqwest::Url] {
        &self.targets
    }

    /// Probe every target once, concurrently.
    pub async fn probe_all(&self) -> Vec<bool> {
        join_all(self.targets.iter().map(|url| self.probe(url))).await
    }

    async fn probe(&self, url: &reqwest::Url) -> bool {
        match self
            .client
            .get(url.clone())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Block until all targets are healthy. Returns the number of probe rounds.
    pub async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<u32, ReadinessError> {
        let started = tokio::time::Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let states = tokio::select! {
                _ = cancel.cancelled() => return Err(ReadinessError::Cancelled { attempts }),
                states = self.probe_all() => states,
            };

            if states.iter().all(|healthy| *healthy) {
                tracing::info!(attempts, targets = self.targets.len(), "All services ready");
                return Ok(attempts);
            }

            if attempts % self.report_every == 0 {
                tracing::info!(attempts, status = %self.describe(&states), "Waiting for services");
            }

            if let Some(max_wait) = self.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    tracing::warn!(attempts, status = %self.describe(&states), "Services not ready in time");
                    return Err(ReadinessError::TimedOut { waited, attempts });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ReadinessError::Cancelled { attempts }),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn describe(&self, states: &[bool]) -> String {
        self.targets
            .iter()
            .zip(states)
            .map(|(url, healthy)| format!("{url}={}", if *healthy { "up" } else { "down" }))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn parse_target(target: &str) -> Result<reqwest::Url, ReadinessError> {
    let invalid = |reason: String| ReadinessError::InvalidTarget {
        target: target.to_string(),
        reason,
    };
    let url = reqwest::Url::parse(target).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::{Router, routing::get};

    use super::*;

    fn fast_config() -> ReadinessConfig {
        ReadinessConfig {
            poll_interval: Duration::from_millis(20),
            ..ReadinessConfig::default()
        }
    }

    /// Serves `/health`, failing the first `failures` probes.
    async fn health_server(failures: u32) -> String {
        let hits = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route(
                "/health",
                get(move |State(hits): State<Arc<AtomicU32>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < failures {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }),
            )
            .with_state(hits);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/health")
    }

    /// Log sink shared between a test subscriber and its assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }
    }

    /// A local address nothing listens on.
    async fn dead_target() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/health")
    }

    #[tokio::test]
    async fn ready_once_all_targets_answer() {
        let healthy = health_server(0).await;
        let flaky = health_server(2).await;
        let gate = ReadinessGate::new([healthy, flaky], &fast_config()).unwrap();

        let attempts = gate
            .wait_until_ready(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn progress_is_logged_every_nth_round() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let config = ReadinessConfig {
            poll_interval: Duration::from_millis(5),
            report_every: 5,
            ..fast_config()
        };
        let gate = ReadinessGate::new([health_server(11).await], &config).unwrap();

        let attempts = gate
            .wait_until_ready(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempts, 12);

        let text = logs.text();
        assert_eq!(text.matches("Waiting for services").count(), 2);
        assert!(text.contains("attempts=5 "));
        assert!(text.contains("attempts=10 "));
        assert!(text.contains("=down"));
        assert!(text.contains("All services ready"));
    }

    #[tokio::test]
    async fn no_targets_is_ready() {
        let gate = ReadinessGate::new(Vec::<String>::new(), &fast_config()).unwrap();
        assert_eq!(
            gate.wait_until_ready(&CancellationToken::new()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn cancellation_ends_the_wait() {
        let gate = ReadinessGate::new([dead_target().await], &fast_config()).unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(2), gate.wait_until_ready(&cancel))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ReadinessError::Cancelled { attempts } if attempts >= 1));
    }

    #[tokio::test]
    async fn optional_deadline_times_out() {
        let config = ReadinessConfig {
            max_wait: Some(Duration::from_millis(100)),
            ..fast_config()
        };
        let gate = ReadinessGate::new([dead_target().await], &config).unwrap();

        let err = gate
            .wait_until_ready(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::TimedOut { .. }));
    }

    #[test]
    fn rejects_bad_targets() {
        let config = ReadinessConfig::default();
        assert!(matches!(
            ReadinessGate::new(["not a url"], &config),
            Err(ReadinessError::InvalidTarget { .. })
        ));
        assert!(matches!(
            ReadinessGate::new(["ftp://localhost/health"], &config),
            Err(ReadinessError::InvalidTarget { .. })
        ));
    }
}
