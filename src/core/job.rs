//! One execution attempt of a target's capture.
//!
//! A `Job` lives from registry admission until its outcome has been folded
//! into the target. Its log buffer has its own lock so readers of one job
//! never contend with writers of another, nor with the registry map.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::models::{CaptureMethod, Target, TargetId, TargetStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub stream: Stream,
    pub text: String,
}

struct LogBuffer {
    lines: VecDeque<LogLine>,
    /// Lines evicted from the front once `capacity` was reached.
    dropped: u64,
    last_append: Instant,
}

const DROP_MARKER_SUFFIX: &str = "earlier lines dropped]";

/// True for the header line `JobLog::contents` writes when output was cut.
pub fn is_drop_marker(line: &str) -> bool {
    line.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(DROP_MARKER_SUFFIX))
        .is_some_and(|count| {
            let count = count.trim_end();
            !count.is_empty() && count.bytes().all(|b| b.is_ascii_digit())
        })
}

/// Bounded, append-only, ordered log of a job's tool output.
pub struct JobLog {
    capacity: usize,
    inner: RwLock<LogBuffer>,
}

impl JobLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(LogBuffer {
                lines: VecDeque::new(),
                dropped: 0,
                last_append: Instant::now(),
            }),
        }
    }

    pub fn append(&self, stream: Stream, text: impl Into<String>) {
        let mut buf = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if buf.lines.len() == self.capacity {
            buf.lines.pop_front();
            buf.dropped += 1;
        }
        buf.lines.push_back(LogLine {
            stream,
            text: text.into(),
        });
        buf.last_append = Instant::now();
    }

    /// Reset the idle clock without adding a line.
    pub fn touch(&self) {
        let mut buf = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        buf.last_append = Instant::now();
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let buf = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let skip = buf.lines.len().saturating_sub(n);
        buf.lines.iter().skip(skip).map(|l| l.text.clone()).collect()
    }

    /// The last `limit` lines, newline-joined, prefixed with a marker when
    /// earlier output is missing.
    pub fn contents(&self, limit: usize) -> String {
        let buf = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let skip = buf.lines.len().saturating_sub(limit);
        let omitted = buf.dropped + skip as u64;

        let mut out = String::new();
        if omitted > 0 {
            out.push_str(&format!("[{} {}\n", omitted, DROP_MARKER_SUFFIX));
        }
        for line in buf.lines.iter().skip(skip) {
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }

    pub fn total_lines(&self) -> u64 {
        let buf = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        buf.dropped + buf.lines.len() as u64
    }

    /// Time since the last line (or `touch`).
    pub fn idle_for(&self) -> Duration {
        let buf = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        buf.last_append.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit request through `request_cancel`.
    Operator,
    /// No output for longer than the stuck threshold.
    Stuck,
    /// Daemon is shutting down.
    Shutdown,
    /// The capture ran past its method's wall-clock limit.
    Timeout,
}

/// Cooperative cancellation flag. The first reason recorded wins.
#[derive(Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the job was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

pub struct Job {
    pub id: Uuid,
    /// Snapshot of the target at admission.
    pub target: Target,
    /// 1-based attempt within the current failure episode.
    pub attempt: u32,
    pub admitted_at: DateTime<Utc>,
    pub log: Arc<JobLog>,
    pub cancel: CancelSignal,
    granted: AtomicBool,
    slot: Notify,
    started: OnceLock<(DateTime<Utc>, Instant)>,
    finishing: AtomicBool,
    released: CancellationToken,
}

impl Job {
    pub fn new(target: Target, log_capacity: usize) -> Self {
        Self {
            id: Uuid::now_v7(),
            attempt: target.retry_count + 1,
            target,
            admitted_at: Utc::now(),
            log: Arc::new(JobLog::new(log_capacity)),
            cancel: CancelSignal::new(),
            granted: AtomicBool::new(false),
            slot: Notify::new(),
            started: OnceLock::new(),
            finishing: AtomicBool::new(false),
            released: CancellationToken::new(),
        }
    }

    pub fn target_id(&self) -> TargetId {
        self.target.id
    }

    pub fn method(&self) -> CaptureMethod {
        self.target.method
    }

    /// Called by the registry, under its lock, when a worker slot is assigned.
    pub(crate) fn grant(&self) {
        self.granted.store(true, Ordering::Release);
    }

    pub(crate) fn notify_granted(&self) {
        self.slot.notify_one();
    }

    pub fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    pub async fn wait_for_slot(&self) {
        if self.is_granted() {
            return;
        }
        self.slot.notified().await;
    }

    /// Record the moment the capture process is about to launch.
    pub fn mark_started(&self) {
        if self.started.set((Utc::now(), Instant::now())).is_ok() {
            self.log.touch();
        }
    }

    /// The outcome is being written to the target. From here on the job is
    /// no longer reported as active, though it keeps its registry entry
    /// until `on_complete`.
    pub fn mark_finishing(&self) {
        self.finishing.store(true, Ordering::Release);
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::Acquire)
    }

    pub(crate) fn release(&self) {
        self.released.cancel();
    }

    /// Resolves once the registry has dropped this job.
    pub async fn released(&self) {
        self.released.cancelled().await
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started.get().map(|(at, _)| *at)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started.get().map(|(_, at)| at.elapsed())
    }

    pub fn phase(&self) -> TargetStatus {
        if self.is_granted() {
            TargetStatus::Crawling
        } else {
            TargetStatus::Queued
        }
    }

    pub fn snapshot(&self, tail_lines: usize) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            target_id: self.target.id,
            url: self.target.url.clone(),
            method: self.target.method,
            attempt: self.attempt,
            phase: self.phase(),
            admitted_at: self.admitted_at,
            started_at: self.started_at(),
            elapsed_secs: self.elapsed().map(|d| d.as_secs()),
            idle_secs: self.log.idle_for().as_secs(),
            cancelling: self.cancel.is_cancelled(),
            total_lines: self.log.total_lines(),
            log_tail: self.log.tail(tail_lines),
        }
    }
}

/// Point-in-time view of an active job, safe to hand to any caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub target_id: TargetId,
    pub url: String,
    pub method: CaptureMethod,
    pub attempt: u32,
    pub phase: TargetStatus,
    pub admitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: Option<u64>,
    pub idle_secs: u64,
    pub cancelling: bool,
    pub total_lines: u64,
    pub log_tail: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded_and_ordered() {
        let log = JobLog::new(3);
        for i in 0..5 {
            log.append(Stream::Stdout, format!("line {}", i));
        }

        assert_eq!(log.tail(10), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(log.tail(1), vec!["line 4"]);
        assert_eq!(log.total_lines(), 5);
        assert!(log.contents(10).starts_with("[2 earlier lines dropped]\nline 2\n"));
        assert_eq!(log.contents(1), "[4 earlier lines dropped]\nline 4\n");
    }

    #[test]
    fn drop_marker_is_recognised() {
        let log = JobLog::new(2);
        for i in 0..3 {
            log.append(Stream::Stdout, format!("line {}", i));
        }
        let contents = log.contents(2);
        assert!(is_drop_marker(contents.lines().next().unwrap()));
        assert!(!is_drop_marker("line 2"));
        assert!(!is_drop_marker("[download] 100% of 3.2MiB"));
        assert!(!is_drop_marker("[ earlier lines dropped]"));
    }

    #[test]
    fn first_cancel_reason_wins() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        assert!(signal.cancel(CancelReason::Stuck));
        assert!(!signal.cancel(CancelReason::Operator));
        assert_eq!(signal.reason(), Some(CancelReason::Stuck));
        assert!(signal.is_cancelled());
    }

    #[test]
    fn idle_clock_restarts_on_append() {
        let log = JobLog::new(4);
        std::thread::sleep(Duration::from_millis(30));
        assert!(log.idle_for() >= Duration::from_millis(30));
        log.append(Stream::Stderr, "progress");
        assert!(log.idle_for() < Duration::from_millis(30));
    }
}
