//! Watch job endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;

use super::ApiState;
use super::error::ApiError;
use crate::watch::NewWatchJob;

/// GET /api/watch/jobs
pub(super) async fn list_jobs(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.watch_jobs.list().await)
}

/// POST /api/watch/jobs
pub(super) async fn create_job(
    State(state): State<ApiState>,
    Json(input): Json<NewWatchJob>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.watch_jobs.create(input).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct JobPatch {
    interval_minutes: Option<u32>,
    is_enabled: Option<bool>,
}

/// PATCH /api/watch/jobs/{id}
pub(super) async fn update_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(patch): Json<JobPatch>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(minutes) = patch.interval_minutes {
        state.watch_jobs.update_interval(&id, minutes).await?;
    }
    if let Some(enabled) = patch.is_enabled {
        state.watch_jobs.set_enabled(&id, enabled).await?;
    }
    let job = state
        .watch_jobs
        .get(&id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("Watch job {id} not found")))?;
    Ok(Json(job))
}

/// POST /api/watch/jobs/{id}/enable
pub(super) async fn enable_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.watch_jobs.set_enabled(&id, true).await?))
}

/// POST /api/watch/jobs/{id}/disable
pub(super) async fn disable_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.watch_jobs.set_enabled(&id, false).await?))
}

/// DELETE /api/watch/jobs/{id}
pub(super) async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.watch_jobs.delete(&id).await?;
    Ok(Json(json!({ "success": true })))
}
