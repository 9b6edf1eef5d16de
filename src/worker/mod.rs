//! Worker boundary: process supervision and the worker contract.
//!
//! Core components:
//! - `process`: ChildProcessSupervisor (spawn, output lines, Requested → Forced shutdown)
//! - `protocol`: typed `WorkerEvent` lines and the stdin stop command
//! - `launcher`: `WorkerLauncher` seam used by the run supervisor

pub mod launcher;
pub mod process;
pub mod protocol;

pub use launcher::{
    LaunchRequest, LaunchedWorker, ProcessLauncher, StopFlag, WorkerControl, WorkerLauncher,
};
pub use process::{ChildProcessSupervisor, ExitReport, ProcessHandle, ProcessSpec};
pub use protocol::{LogEntry, LogLevel, WorkerEvent};
