//! Child process supervision.
//!
//! Owns the lifecycle of external worker processes:
//! - spawn with piped stdio and injected environment
//! - stdout/stderr forwarded line by line over a per-launch channel
//! - two-state shutdown: graceful signal (`Requested`), then one forced kill
//!   after the grace window if the process is still alive (`Forced`)
//! - exit reported exactly once
//!
//! Every live child is registered so the host can tear all of them down from
//! its shutdown hooks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;

use crate::error::ProcessError;

/// Capacity of the per-launch output line channel.
const OUTPUT_CAPACITY: usize = 1024;

/// What to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of child output, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The forced kill was issued.
    pub forced: bool,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            forced: false,
        }
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Shutdown protocol state of one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Requested,
    Forced,
}

#[derive(Debug)]
enum Control {
    Terminate,
}

/// Cloneable handle that can only request termination.
#[derive(Debug, Clone)]
pub struct ProcessTerminator {
    pid: Option<u32>,
    control: mpsc::UnboundedSender<Control>,
}

impl ProcessTerminator {
    /// Start the graceful-then-forced shutdown. No-op once the process exited.
    pub fn terminate(&self) {
        if self.control.send(Control::Terminate).is_err() {
            tracing::debug!(pid = ?self.pid, "Terminate requested after exit");
        }
    }
}

/// Handle to a spawned child. Consumed by [`ProcessHandle::wait`].
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    terminator: ProcessTerminator,
    exit: watch::Receiver<Option<ExitReport>>,
    output: Option<mpsc::Receiver<OutputLine>>,
    stdin: Option<ChildStdin>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The output line stream of this launch. Available once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputLine>> {
        self.output.take()
    }

    /// Take ownership of the child's stdin.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Write one line to the child's stdin.
    pub async fn send_line(&mut self, line: &str) -> Result<(), ProcessError> {
        let stdin = self.stdin.as_mut().ok_or(ProcessError::StdinClosed)?;
        write_line(stdin, line).await
    }

    pub fn terminator(&self) -> ProcessTerminator {
        self.terminator.clone()
    }

    pub fn terminate(&self) {
        self.terminator.terminate();
    }

    /// The exit report, if the process already ended.
    pub fn try_exit(&self) -> Option<ExitReport> {
        *self.exit.borrow()
    }

    /// Wait for the exit report. The handle is spent afterwards.
    pub async fn wait(mut self) -> ExitReport {
        let report = match self.exit.wait_for(Option::is_some).await {
            Ok(report) => (*report).unwrap_or_else(ExitReport::unknown),
            Err(_) => ExitReport::unknown(),
        };
        report
    }
}

/// Write `line` plus a newline and flush.
pub async fn write_line(stdin: &mut ChildStdin, line: &str) -> Result<(), ProcessError> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

struct Registered {
    pid: Option<u32>,
    terminator: ProcessTerminator,
    exit: watch::Receiver<Option<ExitReport>>,
}

/// Spawns and tracks worker processes.
pub struct ChildProcessSupervisor {
    grace: Duration,
    children: Arc<Mutex<HashMap<u64, Registered>>>,
    next_id: AtomicU64,
}

impl ChildProcessSupervisor {
    /// Create a supervisor whose forced kill fires `grace` after a terminate.
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            children: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Launch a child process.
    pub async fn spawn(&self, spec: ProcessSpec) -> Result<ProcessHandle, ProcessError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let (line_tx, line_rx) = mpsc::channel(OUTPUT_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, OutputStream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, OutputStream::Stderr, line_tx);
        }
        let stdin = child.stdin.take();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let terminator = ProcessTerminator {
            pid,
            control: control_tx,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.children.lock().await.insert(
            id,
            Registered {
                pid,
                terminator: terminator.clone(),
                exit: exit_rx.clone(),
            },
        );

        let children = Arc::clone(&self.children);
        let grace = self.grace;
        tokio::spawn(async move {
            let report = monitor(child, pid, grace, control_rx).await;
            tracing::info!(
                pid = ?pid,
                code = ?report.code,
                signal = ?report.signal,
                forced = report.forced,
                "Worker process exited"
            );
            exit_tx.send_replace(Some(report));
            children.lock().await.remove(&id);
        });

        tracing::info!(pid = ?pid, program = %spec.program, "Worker process spawned");

        Ok(ProcessHandle {
            pid,
            terminator,
            exit: exit_rx,
            output: Some(line_rx),
            stdin,
        })
    }

    /// Number of children that have not exited yet.
    pub async fn live_count(&self) -> usize {
        self.children.lock().await.len()
    }

    /// Terminate every live child and wait until each has exited.
    ///
    /// Registered against host shutdown so no worker outlives the host.
    pub async fn shutdown_all(&self) {
        let pending: Vec<(Option<u32>, watch::Receiver<Option<ExitReport>>)> = {
            let children = self.children.lock().await;
            children
                .values()
                .map(|c| {
                    c.terminator.terminate();
                    (c.pid, c.exit.clone())
                })
                .collect()
        };

        if pending.is_empty() {
            return;
        }
        tracing::info!(count = pending.len(), "Terminating worker processes");

        for (pid, mut exit) in pending {
            if exit.wait_for(Option::is_some).await.is_err() {
                tracing::debug!(pid = ?pid, "Exit channel closed before report");
            }
        }
    }
}

/// Drive one child until it exits, applying the shutdown protocol.
async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    grace: Duration,
    mut control: mpsc::UnboundedReceiver<Control>,
) -> ExitReport {
    let mut state = ShutdownState::Running;
    let mut kill_at: Option<Instant> = None;
    let mut control_open = true;

    loop {
        tokio::select! {
            status = child.wait() => {
                // Reaching here drops any armed kill timer with the loop.
                return match status {
                    Ok(status) => ExitReport {
                        code: status.code(),
                        signal: exit_signal(&status),
                        forced: state == ShutdownState::Forced,
                    },
                    Err(e) => {
                        tracing::error!(pid = ?pid, error = %e, "Failed to wait on worker process");
                        ExitReport {
                            forced: state == ShutdownState::Forced,
                            ..ExitReport::unknown()
                        }
                    }
                };
            }

            cmd = control.recv(), if control_open && state == ShutdownState::Running => {
                match cmd {
                    Some(Control::Terminate) => {
                        if let Err(e) = send_graceful(pid, &mut child) {
                            tracing::warn!(pid = ?pid, error = %e, "Graceful stop signal failed");
                        }
                        state = ShutdownState::Requested;
                        kill_at = Some(Instant::now() + grace);
                    }
                    None => control_open = false,
                }
            }

            _ = tokio::time::sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                kill_at = None;
                match child.try_wait() {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        tracing::warn!(pid = ?pid, "Worker still alive after grace period, force killing");
                        if let Err(e) = child.start_kill() {
                            tracing::error!(pid = ?pid, error = %e, "Force kill failed");
                        }
                        state = ShutdownState::Forced;
                    }
                    Err(e) => {
                        tracing::warn!(pid = ?pid, error = %e, "Liveness probe failed");
                    }
                }
            }
        }
    }
}

/// Forward a pipe line by line. Keeps draining after the receiver is gone so
/// the child never blocks on a full pipe.
fn pump_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    let _ = tx.send(OutputLine { stream, text }).await;
                }
            }
        }
    });
}

/// The child has not been reaped while this runs, so its pid cannot have
/// been recycled.
#[cfg(unix)]
fn send_graceful(pid: Option<u32>, _child: &mut Child) -> Result<(), ProcessError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return Ok(());
    };
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| ProcessError::Signal {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
fn send_graceful(_pid: Option<u32>, child: &mut Child) -> Result<(), ProcessError> {
    // No graceful signal here; the first request already kills.
    child.start_kill().map_err(ProcessError::from)
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
