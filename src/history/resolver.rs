//! Locates the artifact directory for a run id.
//!
//! Two layouts exist on disk:
//! - current: `<root>/<run_id>/<YYYY-MM-DD_runNNN>/…`, newest subdirectory wins
//! - legacy flat: `<root>/<run_id>/raw.csv`

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tokio::fs;

use crate::run::config::validate_run_id;

/// Marker file of the legacy flat layout.
pub const LEGACY_MARKER: &str = "raw.csv";

static RUN_SUBDIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}_run\d{3}$").expect("valid regex"));

/// Whether a directory name follows the dated `YYYY-MM-DD_runNNN` pattern.
pub fn is_run_subdir(name: &str) -> bool {
    RUN_SUBDIR.is_match(name)
}

/// Resolve the artifact directory for `run_id` under `runs_root`.
///
/// Returns `None` when the run does not exist, matches neither layout, or
/// the id is not a plain directory name.
pub async fn resolve(runs_root: &Path, run_id: &str) -> Option<PathBuf> {
    if validate_run_id(run_id).is_err() {
        return None;
    }
    let direct = runs_root.join(run_id);
    if !fs::try_exists(&direct).await.unwrap_or(false) {
        return None;
    }

    match newest_run_subdir(&direct).await {
        Ok(Some(name)) => return Some(direct.join(name)),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(path = %direct.display(), error = %e, "Run sub-search failed");
        }
    }

    if fs::try_exists(direct.join(LEGACY_MARKER)).await.unwrap_or(false) {
        return Some(direct);
    }

    None
}

/// Name of the lexicographically greatest dated subdirectory, if any.
async fn newest_run_subdir(dir: &Path) -> std::io::Result<Option<String>> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_run_subdir(&name) {
            names.push(name);
        }
    }
    names.sort_by(|a, b| b.cmp(a));
    Ok(names.into_iter().next())
}
