//! Run history across the whole runs root.

use std::path::Path;

use serde::Serialize;
use tokio::fs;

use super::aggregate::{RunRecord, aggregate};
use super::resolver::resolve;
use crate::error::HistoryError;
use crate::run::config::validate_run_id;

/// A run record tagged with the stable top-level run id it was found under.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    #[serde(flatten)]
    pub record: RunRecord,
}

/// Summarise every run directory under `runs_root`, newest name first.
///
/// A missing root is an empty history, not an error.
pub async fn list_runs(runs_root: &Path) -> Result<Vec<RunSummary>, HistoryError> {
    if !fs::try_exists(runs_root).await.unwrap_or(false) {
        tracing::warn!(path = %runs_root.display(), "Runs directory not found");
        return Ok(Vec::new());
    }

    let read_err = |source| HistoryError::ReadDir {
        path: runs_root.to_path_buf(),
        source,
    };

    let mut run_ids = Vec::new();
    let mut entries = fs::read_dir(runs_root).await.map_err(read_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
        match entry.file_type().await {
            Ok(t) if t.is_dir() => run_ids.push(entry.file_name().to_string_lossy().to_string()),
            _ => {}
        }
    }

    let mut runs = Vec::with_capacity(run_ids.len());
    for run_id in run_ids {
        let dir = resolve(runs_root, &run_id)
            .await
            .unwrap_or_else(|| runs_root.join(&run_id));
        match aggregate(&dir).await {
            Ok(record) => runs.push(RunSummary { run_id, record }),
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Skipping run"),
        }
    }

    runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
    Ok(runs)
}

/// Resolve and summarise a single run.
pub async fn load_run(runs_root: &Path, run_id: &str) -> Result<RunSummary, HistoryError> {
    validate_run_id(run_id)?;
    let dir = resolve(runs_root, run_id)
        .await
        .ok_or_else(|| HistoryError::RunNotFound {
            run_id: run_id.to_string(),
            root: runs_root.to_path_buf(),
        })?;
    let record = aggregate(&dir).await?;
    Ok(RunSummary {
        run_id: run_id.to_string(),
        record,
    })
}
