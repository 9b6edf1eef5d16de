//! Live run statistics and their state machine.

use serde::{Deserialize, Serialize};

/// Status of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run has happened yet.
    #[default]
    Idle,
    /// The worker is executing.
    Running,
    /// The worker finished normally.
    Completed,
    /// The worker failed.
    Error,
    /// The run was stopped on request.
    Stopped,
}

impl RunStatus {
    /// Terminal states freeze the stats.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Counters of the current (or last) run.
///
/// Single writer (the run's event driver), many readers (snapshots).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub total_scanned: u64,
    pub success: u64,
    pub failed: u64,
    pub excluded: u64,
    pub status: RunStatus,
}

impl RunStats {
    /// Zeroed stats of a freshly started run.
    pub fn running() -> Self {
        Self {
            status: RunStatus::Running,
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Shallow-merge a partial update. Fields absent from the update keep their
    /// value. Returns `false` (and changes nothing) once the stats are frozen.
    pub fn apply(&mut self, update: &StatsUpdate) -> bool {
        if self.is_terminal() {
            return false;
        }
        if let Some(v) = update.total_scanned {
            self.total_scanned = v;
        }
        if let Some(v) = update.success {
            self.success = v;
        }
        if let Some(v) = update.failed {
            self.failed = v;
        }
        if let Some(v) = update.excluded {
            self.excluded = v;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        true
    }

    /// Move to `status` unless already terminal.
    pub fn finish(&mut self, status: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}

/// Partial stats reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_scanned: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}
