//! Supervised execution of a capture tool.
//!
//! The child runs in its own process group so that termination reaches the
//! helpers it forks (yt-dlp's ffmpeg, single-file's browser). Output from both
//! streams is split on `\r` as well as `\n` because download tools redraw
//! progress lines in place.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::job::{CancelReason, CancelSignal, JobLog, Stream};
use crate::logging::EchoSampler;

/// How long to wait for the output pipes to close after the child is gone.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lines longer than this are split.
const MAX_LINE_BYTES: usize = 16 * 1024;

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Wall-clock limit for the whole run.
    pub timeout: Duration,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "how")]
pub enum Termination {
    Exited { code: i32 },
    /// Killed by a signal the runner did not send.
    Signaled { signal: i32 },
    TimedOut,
    /// Killed after the stuck sweep saw no output for too long.
    Stuck,
    /// Killed because the daemon is shutting down.
    Interrupted,
    /// Killed on operator request.
    Cancelled,
}

impl Termination {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => Some(*code),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::Signaled { signal } => Some(*signal),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited { code },
            (None, Some(signal)) => Self::Signaled { signal },
            (None, None) => Self::Exited { code: -1 },
        }
    }

    fn from_cancel(reason: Option<CancelReason>) -> Self {
        match reason {
            Some(CancelReason::Stuck) => Self::Stuck,
            Some(CancelReason::Shutdown) => Self::Interrupted,
            Some(CancelReason::Timeout) => Self::TimedOut,
            Some(CancelReason::Operator) | None => Self::Cancelled,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Exited { code } => format!("exited with code {}", code),
            Self::Signaled { signal } => match Signal::try_from(*signal) {
                Ok(sig) => format!("killed by {}", sig.as_str()),
                Err(_) => format!("killed by signal {}", signal),
            },
            Self::TimedOut => "timed out".to_string(),
            Self::Stuck => "stopped producing output".to_string(),
            Self::Interrupted => "interrupted by shutdown".to_string(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub termination: Termination,
    /// Last lines of combined output.
    pub tail: Vec<String>,
    pub duration: Duration,
}

pub struct ProcessRunner {
    kill_grace: Duration,
    tail_lines: usize,
}

impl ProcessRunner {
    pub fn new(kill_grace: Duration, tail_lines: usize) -> Self {
        Self {
            kill_grace,
            tail_lines,
        }
    }

    /// Run `invocation` to completion, streaming output into `log`.
    ///
    /// Errors only when the process cannot be started. Every other ending,
    /// including timeouts and cancellation, is reported through
    /// `ProcessExit::termination`.
    pub async fn run(
        &self,
        invocation: &Invocation,
        log: &Arc<JobLog>,
        cancel: &CancelSignal,
    ) -> Result<ProcessExit> {
        let started = Instant::now();

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", invocation.program))?;
        let pid = child.id();
        info!(pid, command = %invocation.command_line(), "Capture process started");

        let echo = Arc::new(EchoSampler::new(Duration::from_secs(2)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, log.clone(), echo.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, log.clone(), echo));
        }

        let termination = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for capture process")?;
                Termination::from_status(status)
            }
            _ = tokio::time::sleep(invocation.timeout) => {
                warn!(pid, timeout_secs = invocation.timeout.as_secs(), "Capture process timed out");
                // Loses to a reason recorded first, e.g. an operator cancel.
                cancel.cancel(CancelReason::Timeout);
                self.stop(&mut child, pid, cancel).await
            }
            _ = cancel.cancelled() => self.stop(&mut child, pid, cancel).await,
        };

        drain(readers, pid).await;

        let exit = ProcessExit {
            termination,
            tail: log.tail(self.tail_lines),
            duration: started.elapsed(),
        };
        debug!(
            pid,
            termination = %exit.termination.describe(),
            duration_secs = exit.duration.as_secs(),
            lines = log.total_lines(),
            "Capture process finished"
        );
        Ok(exit)
    }

    async fn stop(&self, child: &mut Child, pid: Option<u32>, cancel: &CancelSignal) -> Termination {
        let reason = cancel.reason();
        info!(pid, ?reason, "Stopping capture process");
        self.terminate(child, pid).await;
        Termination::from_cancel(reason)
    }

    /// SIGTERM the process group, then SIGKILL once the grace period lapses.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        signal_group(pid, Signal::SIGTERM);

        match timeout(self.kill_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(pid, grace_secs = self.kill_grace.as_secs(), "Process ignored SIGTERM, killing");
                signal_group(pid, Signal::SIGKILL);
                if let Err(e) = child.kill().await {
                    warn!(pid, error = %e, "Failed to kill capture process");
                }
            }
        }
    }
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = signal.as_str(), error = %e, "Failed to signal process group"),
    }
}

async fn drain(readers: Vec<JoinHandle<()>>, pid: Option<u32>) {
    for mut reader in readers {
        match timeout(IO_DRAIN_TIMEOUT, &mut reader).await {
            Ok(_) => {}
            Err(_) => {
                // A surviving grandchild still holds the pipe open.
                warn!(pid, "Output pipe still open after exit, abandoning reader");
                signal_group(pid, Signal::SIGKILL);
                reader.abort();
            }
        }
    }
}

fn spawn_reader<R>(
    mut source: R,
    stream: Stream,
    log: Arc<JobLog>,
    echo: Arc<EchoSampler>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut splitter = LineSplitter::default();
        let mut chunk = [0u8; 8192];
        loop {
            let n = match source.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(?stream, error = %e, "Output stream read failed");
                    break;
                }
            };
            for line in splitter.push(&chunk[..n]) {
                record(&log, &echo, stream, line);
            }
        }
        if let Some(line) = splitter.finish() {
            record(&log, &echo, stream, line);
        }
    })
}

fn record(log: &JobLog, echo: &EchoSampler, stream: Stream, line: String) {
    if let Some(skipped) = echo.sample() {
        debug!(?stream, skipped, line = %line, "Capture output");
    }
    log.append(stream, line);
}

/// Incremental splitter for `\r`/`\n` terminated output.
#[derive(Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if let Some(line) = self.take() {
                    lines.push(line);
                }
            } else {
                self.pending.push(b);
                if self.pending.len() >= MAX_LINE_BYTES {
                    lines.extend(self.take());
                }
            }
        }
        lines
    }

    /// Whatever is left after the stream closed without a terminator.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
