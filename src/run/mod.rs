//! Run lifecycle: configuration, live stats, supervision and streaming.

pub mod config;
pub mod stats;
pub mod stream;
pub mod supervisor;

pub use config::{ExclusionFilter, RunConfig, RunMode, validate_run_id};
pub use stats::{RunStats, RunStatus, StatsUpdate};
pub use stream::{StatusStreamer, StreamEvent};
pub use supervisor::{RunSnapshot, RunSupervisor};
