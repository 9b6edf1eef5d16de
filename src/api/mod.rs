//! Local HTTP API: run control, live status, run history and watch jobs.

mod error;
mod history;
mod run;
mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

pub use error::ApiError;

use crate::run::{RunSupervisor, StatusStreamer};
use crate::watch::WatchJobStore;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<RunSupervisor>,
    pub streamer: StatusStreamer,
    pub watch_jobs: Arc<WatchJobStore>,
    pub runs_dir: Arc<PathBuf>,
}

impl ApiState {
    pub fn new(
        supervisor: Arc<RunSupervisor>,
        watch_jobs: Arc<WatchJobStore>,
        runs_dir: impl Into<PathBuf>,
    ) -> Self {
        let streamer = StatusStreamer::new(
            Arc::clone(&supervisor),
            supervisor.defaults().stream_interval,
        );
        Self {
            supervisor,
            streamer,
            watch_jobs,
            runs_dir: Arc::new(runs_dir.into()),
        }
    }
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build the API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/run/start", post(run::start_run))
        .route("/api/run/stop", post(run::stop_run))
        .route("/api/run/status", get(run::run_status))
        .route("/api/run/stream", get(run::stream_run))
        .route("/api/runs", get(history::get_runs))
        .route("/api/runs/{run_id}", get(history::get_run))
        .route(
            "/api/watch/jobs",
            get(watch::list_jobs).post(watch::create_job),
        )
        .route(
            "/api/watch/jobs/{id}",
            axum::routing::patch(watch::update_job).delete(watch::delete_job),
        )
        .route("/api/watch/jobs/{id}/enable", post(watch::enable_job))
        .route("/api/watch/jobs/{id}/disable", post(watch::disable_job))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
