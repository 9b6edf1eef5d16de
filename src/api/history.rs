//! Run history endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;

use super::ApiState;
use super::error::ApiError;
use crate::history::{list_runs, load_run};

/// GET /api/runs
pub(super) async fn get_runs(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(list_runs(&state.runs_dir).await?))
}

/// GET /api/runs/{run_id}
pub(super) async fn get_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(load_run(&state.runs_dir, &run_id).await?))
}
