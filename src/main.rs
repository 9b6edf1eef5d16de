use std::sync::Arc;
use std::time::Duration;

use scrape_supervisor::api::{ApiState, api_routes};
use scrape_supervisor::config::SupervisorConfig;
use scrape_supervisor::error::ReadinessError;
use scrape_supervisor::readiness::ReadinessGate;
use scrape_supervisor::run::RunSupervisor;
use scrape_supervisor::watch::{WatchJobStore, spawn_watch_ticker};
use scrape_supervisor::worker::{ChildProcessSupervisor, ProcessLauncher, WorkerLauncher};
use tokio_util::sync::CancellationToken;

const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SupervisorConfig::from_env();

    eprintln!("Scrape Supervisor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://127.0.0.1:{}", config.port);
    eprintln!("   Worker: {} {}", config.worker.program, config.worker.args.join(" "));
    eprintln!("   Runs: {}", config.runs_dir.display());
    eprintln!("   Watch jobs: {}", config.watch_jobs_path().display());

    let processes = Arc::new(ChildProcessSupervisor::new(config.run.grace_period));
    let launcher: Arc<dyn WorkerLauncher> = Arc::new(ProcessLauncher::new(
        Arc::clone(&processes),
        config.worker.clone(),
        config.port,
    ));
    let supervisor = Arc::new(RunSupervisor::new(
        launcher,
        config.run.clone(),
        config.runs_dir.clone(),
    ));
    let watch_jobs = Arc::new(WatchJobStore::new(config.watch_jobs_path()));

    let shutdown = CancellationToken::new();

    // ── HTTP API ──────────────────────────────────────────────────────────
    let app = api_routes(ApiState::new(
        Arc::clone(&supervisor),
        Arc::clone(&watch_jobs),
        config.runs_dir.clone(),
    ));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    tracing::info!(port = config.port, "API server started");
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });

    // ── Readiness ─────────────────────────────────────────────────────────
    let mut targets = vec![format!("http://127.0.0.1:{}/health", config.port)];
    targets.extend(config.readiness.extra_targets.iter().cloned());
    let gate = ReadinessGate::new(targets, &config.readiness)?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match gate.wait_until_ready(&shutdown).await {
                Ok(_) => eprintln!("   Ready."),
                Err(ReadinessError::Cancelled { .. }) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Startup readiness failed");
                    shutdown.cancel();
                }
            }
        }
    });

    // ── Watch scheduler ───────────────────────────────────────────────────
    let ticker = spawn_watch_ticker(
        Arc::clone(&watch_jobs),
        Arc::clone(&supervisor),
        config.watch_tick,
    );

    tokio::select! {
        _ = shutdown_signal() => tracing::info!("Shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    ticker.abort();
    supervisor.shutdown().await;
    processes.shutdown_all().await;

    // Open status streams keep connections alive; don't wait on them forever.
    match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, server).await {
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "API server error"),
        Ok(Err(e)) => tracing::error!(error = %e, "API server task failed"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => tracing::warn!("API connections still open, exiting anyway"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
