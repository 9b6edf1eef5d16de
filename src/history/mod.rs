//! Run history: outcome summaries rebuilt from on-disk artifacts.
//!
//! - `resolver`: maps a run id to its artifact directory (current and legacy layouts)
//! - `aggregate`: parses failure/success tables into a `RunRecord`
//! - `listing`: history views over the whole runs root

pub mod aggregate;
pub mod listing;
pub mod resolver;

pub use aggregate::{HistoryStatus, MappingStatus, MappingSummary, RunRecord, aggregate};
pub use listing::{RunSummary, list_runs, load_run};
pub use resolver::resolve;
