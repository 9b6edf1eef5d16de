//! Rebuilds run outcome statistics from a run's artifact files.
//!
//! Nothing here is persisted: every call re-reads the directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::fs;

use crate::error::HistoryError;

/// Suffix of per-stage failure tables.
pub const FAILED_SUFFIX: &str = "_failed.csv";

/// Recognised success tables, highest priority first.
pub const SUCCESS_FILES: &[&str] = &["amazon.tsv", "raw.csv"];

/// Any of these marks a run as completed regardless of failures.
const UPLOAD_FILES: &[&str] = &["amazon.tsv", "amazon_upload.tsv"];

const MAPPING_FILE: &str = "mapping.csv";

/// Maximum number of failure samples kept per run.
pub const MAX_FAILURE_SAMPLES: usize = 20;

const REASON_COLUMNS: &[&str] = &["reason_detail", "reason", "error", "message", "detail"];
const URL_COLUMNS: &[&str] = &["item_url", "url", "link"];
const TITLE_COLUMNS: &[&str] = &["title", "item_title", "name"];

const UNKNOWN_REASON: &str = "Unknown";
const NO_TITLE: &str = "No Title";

static DATE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4}-\d{2}-\d{2})").expect("valid regex"));

static UUID_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})")
        .expect("valid regex")
});

/// Final state of a run as read back from disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    #[default]
    Completed,
    Failed,
}

/// Outcome counters of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_scanned: u64,
    pub success: u64,
    pub failed: u64,
    pub status: HistoryStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Custom,
    Standard,
    #[default]
    None,
}

/// Shape of the run's category mapping table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingSummary {
    pub status: MappingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
}

/// How often one failure reason occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: u64,
}

/// A sampled failed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSample {
    pub url: String,
    pub title: String,
    pub reason: String,
}

/// Which output files a run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactPresence {
    pub has_amazon: bool,
    pub has_profit: bool,
    pub has_asin: bool,
    pub has_raw: bool,
    pub has_mapping: bool,
    pub mapping: MappingSummary,
}

/// Summary of one run, derived from its artifact directory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub name: String,
    pub date: String,
    pub path: PathBuf,
    pub stats: HistoryStats,
    pub failure_reasons: Vec<ReasonCount>,
    pub failed_urls: Vec<FailureSample>,
    pub config_exists: bool,
    pub artifacts: ArtifactPresence,
}

/// One parsed row: header name → cell, in header order.
type Row = Vec<(String, String)>;

/// Aggregate the artifacts found directly inside `run_dir`.
///
/// A malformed artifact is logged and contributes nothing; only failing to
/// list the directory itself is an error.
pub async fn aggregate(run_dir: &Path) -> Result<RunRecord, HistoryError> {
    let files = list_files(run_dir).await.map_err(|source| HistoryError::ReadDir {
        path: run_dir.to_path_buf(),
        source,
    })?;

    let mut stats = HistoryStats::default();
    let mut reasons = ReasonTally::default();
    let mut samples = Vec::new();

    for name in files.iter().filter(|f| f.ends_with(FAILED_SUFFIX)) {
        let path = run_dir.join(name);
        let rows = match read_table(&path).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Skipping unreadable failure table");
                continue;
            }
        };

        stats.failed += rows.len() as u64;

        for row in &rows {
            let reason = non_empty(lookup(row, REASON_COLUMNS))
                .unwrap_or(UNKNOWN_REASON)
                .to_string();
            reasons.add(&reason);

            if samples.len() < MAX_FAILURE_SAMPLES {
                if let Some(url) = non_empty(lookup(row, URL_COLUMNS)) {
                    let title = non_empty(lookup(row, TITLE_COLUMNS)).unwrap_or(NO_TITLE);
                    samples.push(FailureSample {
                        url: url.to_string(),
                        title: title.to_string(),
                        reason,
                    });
                }
            }
        }
    }

    if let Some(name) = SUCCESS_FILES
        .iter()
        .copied()
        .find(|f| files.iter().any(|n| n == f))
    {
        let path = run_dir.join(name);
        match fs::read(&path).await {
            Ok(bytes) => stats.success = count_data_lines(&String::from_utf8_lossy(&bytes)),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Skipping unreadable success table");
            }
        }
    }

    stats.total_scanned = stats.success + stats.failed;
    stats.status = if UPLOAD_FILES.iter().any(|f| files.iter().any(|n| n == f)) {
        HistoryStatus::Completed
    } else if stats.failed > 0 {
        HistoryStatus::Failed
    } else {
        HistoryStatus::Completed
    };

    let name = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let (id, date) = identify(&name);
    let date = match date {
        Some(date) => date,
        None => creation_date(run_dir).await,
    };

    let has = |file: &str| files.iter().any(|n| n == file);
    let mapping = if has(MAPPING_FILE) {
        summarize_mapping(&run_dir.join(MAPPING_FILE)).await
    } else {
        MappingSummary::default()
    };

    Ok(RunRecord {
        id,
        name,
        date,
        path: run_dir.to_path_buf(),
        stats,
        failure_reasons: reasons.ranked(),
        failed_urls: samples,
        config_exists: has("config.json"),
        artifacts: ArtifactPresence {
            has_amazon: has("amazon.tsv"),
            has_profit: has("profit.tsv"),
            has_asin: has("asin.tsv"),
            has_raw: has("raw.csv"),
            has_mapping: has(MAPPING_FILE),
            mapping,
        },
    })
}

/// Derive `(id, date)` from a run directory name.
///
/// The id is an embedded UUID when present, else the name itself. The date is
/// a leading `YYYY-MM-DD` prefix, if any.
pub fn identify(dir_name: &str) -> (String, Option<String>) {
    let id = UUID_TOKEN
        .captures(dir_name)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| dir_name.to_string());
    let date = DATE_PREFIX.captures(dir_name).map(|c| c[1].to_string());
    (id, date)
}

async fn summarize_mapping(path: &Path) -> MappingSummary {
    match fs::read(path).await {
        Ok(bytes) => {
            let rows = String::from_utf8_lossy(&bytes)
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count() as u64;
            MappingSummary {
                status: if rows > 1 {
                    MappingStatus::Custom
                } else {
                    MappingStatus::Standard
                },
                rows: Some(rows),
            }
        }
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "Skipping unreadable mapping table");
            MappingSummary::default()
        }
    }
}

/// Count data rows of a line-oriented table: non-blank lines minus the header.
pub fn count_data_lines(content: &str) -> u64 {
    let lines = content.lines().filter(|l| !l.trim().is_empty()).count() as u64;
    lines.saturating_sub(1)
}

/// Reason → count, remembering first-seen order for tie breaks.
#[derive(Default)]
struct ReasonTally {
    order: Vec<ReasonCount>,
    index: HashMap<String, usize>,
}

impl ReasonTally {
    fn add(&mut self, reason: &str) {
        match self.index.get(reason) {
            Some(&i) => self.order[i].count += 1,
            None => {
                self.index.insert(reason.to_string(), self.order.len());
                self.order.push(ReasonCount {
                    reason: reason.to_string(),
                    count: 1,
                });
            }
        }
    }

    fn ranked(mut self) -> Vec<ReasonCount> {
        // Stable: equal counts keep first-seen order.
        self.order.sort_by(|a, b| b.count.cmp(&a.count));
        self.order
    }
}

/// First candidate column present in the row; exact match wins over a
/// case-insensitive one.
fn lookup<'a>(row: &'a Row, candidates: &[&str]) -> Option<&'a str> {
    for candidate in candidates {
        if let Some((_, v)) = row.iter().find(|(k, _)| k == candidate) {
            return Some(v.as_str());
        }
        if let Some((_, v)) = row.iter().find(|(k, _)| k.eq_ignore_ascii_case(candidate)) {
            return Some(v.as_str());
        }
    }
    None
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Parse a header-led delimited table. Ragged rows are kept with whatever
/// cells they have; blank rows are dropped.
async fn read_table(path: &Path) -> Result<Vec<Row>, csv::Error> {
    let bytes = fs::read(path).await?;
    parse_table(&bytes)
}

fn parse_table(bytes: &[u8]) -> Result<Vec<Row>, csv::Error> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record?;
        if record.iter().all(|cell| cell.iter().all(u8::is_ascii_whitespace)) {
            continue;
        }
        let row: Row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, cell)| (h.clone(), String::from_utf8_lossy(cell).to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

async fn list_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

async fn creation_date(dir: &Path) -> String {
    let Ok(meta) = fs::metadata(dir).await else {
        return "Unknown".to_string();
    };
    match meta.created().or_else(|_| meta.modified()) {
        Ok(time) => DateTime::<Utc>::from(time).format("%Y-%m-%d").to_string(),
        Err(_) => "Unknown".to_string(),
    }
}
