//! Run control endpoints and the live status stream.

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use super::ApiState;
use super::error::ApiError;
use crate::run::{RunConfig, StreamEvent};

/// POST /api/run/start
pub(super) async fn start_run(
    State(state): State<ApiState>,
    Json(config): Json<RunConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = state.supervisor.start(config).await?;
    Ok(Json(json!({ "success": true, "runId": run_id })))
}

/// POST /api/run/stop
pub(super) async fn stop_run(State(state): State<ApiState>) -> impl IntoResponse {
    let stopped = state.supervisor.stop().await;
    Json(json!({ "success": true, "stopped": stopped }))
}

/// GET /api/run/status
pub(super) async fn run_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.supervisor.snapshot().await)
}

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    #[serde(rename = "runId")]
    run_id: Option<String>,
}

/// GET /api/run/stream?runId=
pub(super) async fn stream_run(
    State(state): State<ApiState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let run_id = match query.run_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => state
            .supervisor
            .snapshot()
            .await
            .run_id
            .unwrap_or_else(|| "current".to_string()),
    };

    let events = state
        .streamer
        .subscribe(run_id)
        .map(|event| Ok(sse_event(&event)));

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data().to_string())
}
