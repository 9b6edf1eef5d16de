//! Recurring watch jobs: model, persistence and the due-job ticker.

pub mod model;
pub mod scheduler;
pub mod store;

pub use model::{NewWatchJob, WatchJob, WatchJobStats};
pub use scheduler::{PendingWatchRun, check_due_jobs, settle_watch_run, spawn_watch_ticker};
pub use store::WatchJobStore;
