//! Scrape Supervisor: runs, observes and schedules an external scrape worker.

pub mod api;
pub mod config;
pub mod error;
pub mod history;
pub mod readiness;
pub mod run;
pub mod watch;
pub mod worker;
