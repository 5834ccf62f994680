//! Periodic sweeps: due retries, due recurrences and stuck jobs.
//!
//! Sweeps only go through `Orchestrator` operations. A sweep of one kind
//! never overlaps itself; a trigger that finds one running is skipped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::CrawlError;
use crate::core::job::CancelReason;
use crate::core::models::{Target, TargetStatus};
use crate::core::orchestrator::Orchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Retry,
    Recurrence,
    Stuck,
}

impl SweepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Recurrence => "recurrence",
            Self::Stuck => "stuck",
        }
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Candidates the sweep looked at.
    pub scanned: usize,
    /// Jobs admitted (retry, recurrence) or cancelled (stuck).
    pub acted: usize,
    pub failed: usize,
    /// Orphaned targets folded or re-admitted (stuck sweep only).
    pub recovered: usize,
    /// Another sweep of the same kind was still running.
    pub skipped: bool,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    orchestrator: Orchestrator,
    retry_running: AtomicBool,
    recurrence_running: AtomicBool,
    stuck_running: AtomicBool,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            retry_running: AtomicBool::new(false),
            recurrence_running: AtomicBool::new(false),
            stuck_running: AtomicBool::new(false),
        }
    }

    /// Admit every `retry_pending` target whose `next_run_at` is at or
    /// before `now`.
    pub async fn retry_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, CrawlError> {
        let Some(_guard) = SweepGuard::enter(&self.retry_running) else {
            return Ok(SweepReport::skipped());
        };
        let due = self.orchestrator.targets().list_due_retries(now).await?;
        Ok(self.admit_all(SweepKind::Retry, due, now).await)
    }

    /// Start a new episode for every `ready` target whose recurrence
    /// interval has elapsed since its last success.
    pub async fn recurrence_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, CrawlError> {
        let Some(_guard) = SweepGuard::enter(&self.recurrence_running) else {
            return Ok(SweepReport::skipped());
        };
        let due = self.orchestrator.targets().list_due_recurrences(now).await?;
        Ok(self.admit_all(SweepKind::Recurrence, due, now).await)
    }

    /// Cancel running jobs that have been silent for longer than their
    /// method's threshold, then recover orphaned targets.
    pub async fn stuck_sweep(&self) -> Result<SweepReport, CrawlError> {
        let Some(_guard) = SweepGuard::enter(&self.stuck_running) else {
            return Ok(SweepReport::skipped());
        };

        let mut report = SweepReport::default();
        let config = self.orchestrator.config();
        let registry = self.orchestrator.registry();

        for snapshot in registry.list_active(0) {
            if snapshot.phase != TargetStatus::Crawling {
                continue;
            }
            let Some(job) = registry.get(snapshot.target_id) else {
                continue;
            };
            if job.id != snapshot.job_id {
                continue;
            }
            report.scanned += 1;

            let idle = job.log.idle_for();
            let threshold = config.stuck_threshold(job.method());
            if idle <= threshold {
                continue;
            }
            if self
                .orchestrator
                .cancel_with(job.target_id(), CancelReason::Stuck)
            {
                warn!(
                    target_id = job.target_id(),
                    job_id = %job.id,
                    idle_secs = idle.as_secs(),
                    threshold_secs = threshold.as_secs(),
                    "Cancelling stuck crawl"
                );
                report.acted += 1;
            }
        }

        match self.orchestrator.recover_orphans().await {
            Ok(recovery) => report.recovered = recovery.interrupted + recovery.requeued,
            Err(e) => {
                warn!(error = %e, "Orphan recovery failed");
                report.failed += 1;
            }
        }

        Ok(report)
    }

    /// Admit each listed target. The due check is repeated under the
    /// target's claim, so one that changed since the listing is left alone.
    async fn admit_all(
        &self,
        kind: SweepKind,
        due: Vec<Target>,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let mut report = SweepReport {
            scanned: due.len(),
            ..SweepReport::default()
        };

        for target in due {
            let orchestrator = &self.orchestrator;
            let started = match kind {
                SweepKind::Recurrence => orchestrator.start_due_recurrence(target.id, now).await,
                SweepKind::Retry | SweepKind::Stuck => {
                    orchestrator.start_due_retry(target.id, now).await
                }
            };
            match started {
                Ok(outcome) if outcome.admitted() => report.acted += 1,
                Ok(_) => debug!(target_id = target.id, sweep = %kind, "Target already active"),
                Err(CrawlError::NotStartable { status, .. }) => {
                    debug!(target_id = target.id, sweep = %kind, %status, "Target no longer due");
                }
                Err(e) => {
                    warn!(target_id = target.id, sweep = %kind, error = %e, "Sweep failed to start target");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn run(&self, kind: SweepKind) -> Result<SweepReport, CrawlError> {
        match kind {
            SweepKind::Retry => self.retry_sweep(Utc::now()).await,
            SweepKind::Recurrence => self.recurrence_sweep(Utc::now()).await,
            SweepKind::Stuck => self.stuck_sweep().await,
        }
    }

    /// Spawn one loop per sweep kind. Loops exit when `shutdown` fires.
    pub fn spawn_loops(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let sweeps = &self.orchestrator.config().sweeps;
        [
            (SweepKind::Retry, sweeps.retry_secs),
            (SweepKind::Recurrence, sweeps.recurrence_secs),
            (SweepKind::Stuck, sweeps.stuck_secs),
        ]
        .into_iter()
        .map(|(kind, secs)| {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            let period = Duration::from_secs(secs.max(1));
            tokio::spawn(async move { this.sweep_loop(kind, period, shutdown).await })
        })
        .collect()
    }

    async fn sweep_loop(&self, kind: SweepKind, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(sweep = %kind, period_secs = period.as_secs(), "Sweep loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run(kind).await {
                Ok(report) if report.acted > 0 || report.failed > 0 || report.recovered > 0 => {
                    info!(
                        sweep = %kind,
                        scanned = report.scanned,
                        acted = report.acted,
                        failed = report.failed,
                        recovered = report.recovered,
                        "Sweep finished"
                    );
                }
                Ok(report) => debug!(sweep = %kind, scanned = report.scanned, skipped = report.skipped, "Sweep finished"),
                Err(e) => warn!(sweep = %kind, error = %e, "Sweep failed"),
            }
        }
        debug!(sweep = %kind, "Sweep loop stopped");
    }
}
