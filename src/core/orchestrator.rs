//! The crawl orchestration engine.
//!
//! `Orchestrator` is the only writer of target lifecycle state. Every public
//! operation first claims the target in the `JobRegistry`; whoever holds the
//! claim may touch the persisted record, so two callers never interleave
//! writes for the same target.
//!
//! ```text
//! request_start ─► registry.try_start ─► pending/queued written ─► driver task
//!                                                                   │
//!        wait_for_slot ◄──────────────────────────────────────────┘
//!             │
//!             ├─► crawling written ─► ProcessRunner ─► strategy.interpret
//!             │                                           │
//!             │                                       classifier
//!             ▼                                           │
//!        state::resolve ◄─────────────────────────────────┘
//!             │
//!             └─► target updated ─► registry.on_complete ─► CrawlRecord stored
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::classifier;
use crate::core::error::CrawlError;
use crate::core::job::{CancelReason, Job, JobSnapshot, is_drop_marker};
use crate::core::models::{
    CrawlRecord, FailureKind, NewTarget, Outcome, OutcomeKind, Target, TargetId, TargetStatus,
    TargetUpdate,
};
use crate::core::registry::{Admission, AdmitError, JobRegistry, RegistryCounts};
use crate::core::runner::ProcessRunner;
use crate::core::state::{self, RetryPolicy};
use crate::core::store::{LogStore, TargetStore, recurrence_due};
use crate::core::strategy::{RawOutcome, StrategySet};

/// Log lines returned by `query_status` when the caller does not ask.
pub const DEFAULT_STATUS_LINES: usize = 50;

const EVENT_CAPACITY: usize = 256;
const ORPHAN_SUMMARY: &str = "interrupted: process handle lost";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CrawlEvent {
    Queued {
        target_id: TargetId,
        job_id: Uuid,
        /// Position in the wait queue, `None` when a slot was free.
        position: Option<usize>,
    },
    Started {
        target_id: TargetId,
        job_id: Uuid,
        attempt: u32,
    },
    Finished {
        target_id: TargetId,
        job_id: Uuid,
        status: TargetStatus,
        outcome: OutcomeKind,
        summary: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { job_id: Uuid },
    Queued { job_id: Uuid, position: usize },
    /// A job for this target was already queued or running.
    AlreadyActive { job_id: Uuid, phase: TargetStatus },
}

impl StartOutcome {
    pub fn admitted(&self) -> bool {
        !matches!(self, Self::AlreadyActive { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Live phase while a job is active, the persisted status otherwise.
    pub status: TargetStatus,
    pub target: Target,
    pub job: Option<JobSnapshot>,
    /// Live output, or the tail of the last finished attempt.
    pub log_tail: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Persisted `crawling` targets with no live process, folded as failures.
    pub interrupted: usize,
    /// Persisted `queued` targets with no live job, admitted again.
    pub requeued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Manual,
    Reset,
    /// Re-admission of a `queued` target left behind by a previous run.
    Recover,
    /// Sweep admission of a `retry_pending` target whose backoff is over.
    Retry { now: DateTime<Utc> },
    /// Sweep admission of a `ready` target whose recurrence is due.
    Recurrence { now: DateTime<Utc> },
}

impl StartMode {
    /// Whether a caller in this mode gets `AlreadyActive` as an answer
    /// rather than an error.
    fn reports_active(self) -> bool {
        matches!(self, Self::Manual | Self::Retry { .. } | Self::Recurrence { .. })
    }

    /// The condition the persisted record must still meet once the target is
    /// claimed. Sweeps list candidates before claiming them, so the record
    /// may have moved on in between.
    fn still_applies(self, target: &Target) -> bool {
        match self {
            Self::Manual | Self::Reset => true,
            Self::Recover => target.status == TargetStatus::Queued,
            Self::Retry { now } => {
                target.status == TargetStatus::RetryPending
                    && target.next_run_at.is_some_and(|at| at <= now)
            }
            Self::Recurrence { now } => {
                target.status == TargetStatus::Ready && recurrence_due(target, now)
            }
        }
    }
}

struct Inner {
    config: Arc<AppConfig>,
    targets: Arc<dyn TargetStore>,
    logs: Arc<dyn LogStore>,
    registry: JobRegistry,
    strategies: StrategySet,
    runner: ProcessRunner,
    policy: RetryPolicy,
    events: broadcast::Sender<CrawlEvent>,
    tracker: TaskTracker,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        targets: Arc<dyn TargetStore>,
        logs: Arc<dyn LogStore>,
    ) -> Self {
        let strategies = StrategySet::from_config(&config);
        Self::with_strategies(config, targets, logs, strategies)
    }

    pub fn with_strategies(
        config: Arc<AppConfig>,
        targets: Arc<dyn TargetStore>,
        logs: Arc<dyn LogStore>,
        strategies: StrategySet,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            registry: JobRegistry::new(
                config.max_concurrent_jobs,
                config.max_queued_jobs,
                config.log_buffer_lines,
            ),
            runner: ProcessRunner::new(config.kill_grace(), config.log_tail_lines),
            policy: RetryPolicy::from(config.as_ref()),
            config,
            targets,
            logs,
            strategies,
            events,
            tracker: TaskTracker::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn targets(&self) -> &Arc<dyn TargetStore> {
        &self.inner.targets
    }

    pub fn counts(&self) -> RegistryCounts {
        self.inner.registry.counts()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.inner.events.subscribe()
    }

    pub async fn add_target(&self, new: NewTarget) -> Result<Target, CrawlError> {
        let parsed = url::Url::parse(&new.url)
            .map_err(|e| CrawlError::InvalidTarget(format!("{}: {}", new.url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CrawlError::InvalidTarget(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let target = self.inner.targets.insert(new).await?;
        info!(target_id = target.id, url = %target.url, method = %target.method, "Target added");
        Ok(target)
    }

    /// Admit a job for `target_id`. Returns `AlreadyActive` rather than an
    /// error when a job is already queued or running.
    pub async fn request_start(&self, target_id: TargetId) -> Result<StartOutcome, CrawlError> {
        self.start(target_id, StartMode::Manual).await
    }

    /// Reset the retry budget to zero and start again. The only way out of
    /// `dead`.
    pub async fn request_reset(&self, target_id: TargetId) -> Result<StartOutcome, CrawlError> {
        self.start(target_id, StartMode::Reset).await
    }

    /// Admit a `retry_pending` target if its backoff has elapsed at `now`.
    /// Fails with `NotStartable` when the target is no longer due.
    pub async fn start_due_retry(
        &self,
        target_id: TargetId,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, CrawlError> {
        self.start(target_id, StartMode::Retry { now }).await
    }

    /// Start a new episode for a `ready` target whose recurrence is due at
    /// `now`. Fails with `NotStartable` when it is not.
    pub async fn start_due_recurrence(
        &self,
        target_id: TargetId,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, CrawlError> {
        self.start(target_id, StartMode::Recurrence { now }).await
    }

    /// Returns false when the target has no active job or its job is
    /// already being cancelled.
    pub async fn request_cancel(&self, target_id: TargetId) -> Result<bool, CrawlError> {
        if self.inner.registry.cancel(target_id, CancelReason::Operator) {
            return Ok(true);
        }
        self.load(target_id).await?;
        Ok(false)
    }

    pub async fn query_status(
        &self,
        target_id: TargetId,
        lines: usize,
    ) -> Result<StatusReport, CrawlError> {
        // Registry first: once a job is gone its outcome is already persisted.
        let job = self.inner.registry.get_status(target_id, lines);
        let target = self.load(target_id).await?;

        match job {
            Some(mut job) => {
                let log_tail = std::mem::take(&mut job.log_tail);
                Ok(StatusReport {
                    status: job.phase,
                    target,
                    job: Some(job),
                    log_tail,
                })
            }
            None => {
                let log_tail = match self.inner.logs.latest(target_id).await {
                    Ok(Some(record)) => tail_of(&record.log, lines),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        warn!(target_id, error = %e, "Failed to load last crawl log");
                        Vec::new()
                    }
                };
                Ok(StatusReport {
                    status: target.status,
                    target,
                    job: None,
                    log_tail,
                })
            }
        }
    }

    pub fn list_active(&self, lines: usize) -> Vec<JobSnapshot> {
        self.inner.registry.list_active(lines)
    }

    /// Cancel through the registry with an explicit reason.
    pub fn cancel_with(&self, target_id: TargetId, reason: CancelReason) -> bool {
        self.inner.registry.cancel(target_id, reason)
    }

    /// Fold persisted `crawling` targets that have no live job into a
    /// failure, and re-admit persisted `queued` targets that have none.
    pub async fn recover_orphans(&self) -> Result<RecoveryReport, CrawlError> {
        let mut report = RecoveryReport::default();

        for target in self.inner.targets.list_by_status(TargetStatus::Crawling).await? {
            if self.inner.registry.contains(target.id) {
                continue;
            }
            // Claim the target so nothing starts it while it is folded.
            let Ok(admission) = self.inner.registry.try_start(&target) else {
                continue;
            };
            let claim = admission.job().id;

            let result = self.fold_if_orphaned(target.id).await;
            self.inner
                .registry
                .on_complete(claim, &Outcome::internal(ORPHAN_SUMMARY, Duration::ZERO));

            match result {
                Ok(true) => report.interrupted += 1,
                Ok(false) => {}
                Err(e) => warn!(target_id = target.id, error = %e, "Failed to recover orphaned crawl"),
            }
        }

        for target in self.inner.targets.list_by_status(TargetStatus::Queued).await? {
            if self.inner.registry.contains(target.id) {
                continue;
            }
            match self.start(target.id, StartMode::Recover).await {
                Ok(outcome) if outcome.admitted() => report.requeued += 1,
                Ok(_) => {}
                Err(CrawlError::NotStartable { .. }) => {}
                Err(e) => warn!(target_id = target.id, error = %e, "Failed to re-admit queued target"),
            }
        }

        if report != RecoveryReport::default() {
            info!(
                interrupted = report.interrupted,
                requeued = report.requeued,
                "Recovered orphaned targets"
            );
        }
        Ok(report)
    }

    /// Cancel every active job as a shutdown and wait, up to `timeout`, for
    /// their outcomes to be recorded. Returns false on timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let cancelled = self.inner.registry.cancel_all(CancelReason::Shutdown);
        info!(cancelled, "Stopping active crawls");

        self.inner.tracker.close();
        match tokio::time::timeout(timeout, self.inner.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.inner.tracker.len(),
                    "Crawls did not stop before the shutdown deadline"
                );
                false
            }
        }
    }

    /// Wait until every job driver spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    async fn load(&self, target_id: TargetId) -> Result<Target, CrawlError> {
        self.inner
            .targets
            .get(target_id)
            .await?
            .ok_or(CrawlError::TargetNotFound(target_id))
    }

    fn emit(&self, event: CrawlEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    async fn start(&self, target_id: TargetId, mode: StartMode) -> Result<StartOutcome, CrawlError> {
        let admission = loop {
            let target = self.load(target_id).await?;
            if mode == StartMode::Manual && target.status == TargetStatus::Dead {
                return Err(CrawlError::NotStartable {
                    id: target_id,
                    status: target.status,
                });
            }

            let mut snapshot = target;
            if mode == StartMode::Reset {
                // Attempt numbering restarts with the reset.
                snapshot.retry_count = 0;
            }

            match self.inner.registry.try_start(&snapshot) {
                Ok(admission) => break admission,
                Err(AdmitError::AlreadyRunning(_)) => match self.inner.registry.get(target_id) {
                    // Released in between; try again.
                    None => continue,
                    // Its outcome is being recorded. Wait for the release and
                    // start from the recorded state.
                    Some(job) if job.is_finishing() => job.released().await,
                    Some(job) if mode.reports_active() => {
                        return Ok(StartOutcome::AlreadyActive {
                            job_id: job.id,
                            phase: job.phase(),
                        });
                    }
                    Some(_) => return Err(CrawlError::AlreadyActive(target_id)),
                },
                Err(e) => return Err(e.into()),
            }
        };
        let job = admission.job().clone();

        if let Err(e) = self.prepare(target_id, mode).await {
            self.inner
                .registry
                .on_complete(job.id, &Outcome::cancelled("start rolled back", Duration::ZERO));
            return Err(e);
        }

        let (outcome, position) = match admission {
            Admission::Started(_) => (StartOutcome::Started { job_id: job.id }, None),
            Admission::Queued { position, .. } => (
                StartOutcome::Queued {
                    job_id: job.id,
                    position,
                },
                Some(position),
            ),
        };

        info!(target_id, job_id = %job.id, attempt = job.attempt, ?position, "Crawl admitted");
        self.emit(CrawlEvent::Queued {
            target_id,
            job_id: job.id,
            position,
        });
        self.spawn_driver(job);
        Ok(outcome)
    }

    /// Bring the persisted record to `queued`. Runs while holding the claim.
    async fn prepare(&self, target_id: TargetId, mode: StartMode) -> Result<(), CrawlError> {
        let mut target = self.load(target_id).await?;

        if !mode.still_applies(&target) {
            return Err(CrawlError::NotStartable {
                id: target_id,
                status: target.status,
            });
        }

        if target.status == TargetStatus::Crawling {
            // We hold the claim, so no process of ours is running it.
            target = self.fold_orphan(&target).await?;
        }

        if mode == StartMode::Reset {
            let update = state::reset(&target)?;
            target = self.inner.targets.update(target_id, &update).await?;
            info!(target_id, "Target reset");
        } else if target.status == TargetStatus::Dead {
            return Err(CrawlError::NotStartable {
                id: target_id,
                status: target.status,
            });
        }

        if matches!(target.status, TargetStatus::Ready | TargetStatus::Cancelled) {
            let update = state::reopen(&target)?;
            target = self.inner.targets.update(target_id, &update).await?;
        }

        if target.status != TargetStatus::Queued {
            let status = state::check(target.status, TargetStatus::Queued)?;
            self.inner
                .targets
                .update(target_id, &TargetUpdate::status_only(&target, status))
                .await?;
        }
        Ok(())
    }

    fn spawn_driver(&self, job: Arc<Job>) {
        let this = self.clone();
        let span = info_span!(
            "crawl",
            target_id = job.target_id(),
            job_id = %job.id,
            method = %job.method()
        );
        self.inner
            .tracker
            .spawn(async move { this.drive(job).await }.instrument(span));
    }

    async fn drive(&self, job: Arc<Job>) {
        match self.execute(&job).await {
            Some((phase, outcome)) => self.finish(&job, phase, outcome).await,
            None => {
                // Left `queued` in the store; recovery re-admits it on startup.
                self.inner
                    .registry
                    .on_complete(job.id, &Outcome::cancelled("shutdown", Duration::ZERO));
                debug!("Queued crawl released for shutdown");
            }
        }
    }

    /// Wait for a slot and run the capture. Returns the phase the job reached
    /// and its outcome, or `None` when a queued job is dropped for shutdown.
    async fn execute(&self, job: &Arc<Job>) -> Option<(TargetStatus, Outcome)> {
        tokio::select! {
            _ = job.wait_for_slot() => {}
            _ = job.cancel.cancelled() => {
                if job.cancel.reason() == Some(CancelReason::Shutdown) {
                    return None;
                }
                return Some((
                    TargetStatus::Queued,
                    Outcome::cancelled("cancelled while queued", Duration::ZERO),
                ));
            }
        }

        let target_id = job.target_id();
        job.mark_started();

        let target = match self.load(target_id).await {
            Ok(target) => target,
            Err(e) => {
                return Some((
                    TargetStatus::Queued,
                    Outcome::internal(format!("failed to load target: {}", e), Duration::ZERO),
                ));
            }
        };
        let status = match state::check(target.status, TargetStatus::Crawling) {
            Ok(status) => status,
            Err(e) => {
                return Some((
                    TargetStatus::Queued,
                    Outcome::internal(e.to_string(), Duration::ZERO),
                ));
            }
        };
        if let Err(e) = self
            .inner
            .targets
            .update(target_id, &TargetUpdate::status_only(&target, status))
            .await
        {
            return Some((
                TargetStatus::Queued,
                Outcome::internal(format!("failed to record start: {:#}", e), Duration::ZERO),
            ));
        }

        info!(attempt = job.attempt, url = %job.target.url, "Crawl started");
        self.emit(CrawlEvent::Started {
            target_id,
            job_id: job.id,
            attempt: job.attempt,
        });

        Some((TargetStatus::Crawling, self.capture(job).await))
    }

    async fn capture(&self, job: &Arc<Job>) -> Outcome {
        let strategy = self.inner.strategies.get(job.method());
        let output_dir = self.inner.config.output_dir(job.target_id());

        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            return Outcome::internal(
                format!("failed to create {}: {}", output_dir.display(), e),
                Duration::ZERO,
            );
        }

        let invocation = strategy.build_invocation(&job.target, &output_dir);
        let exit = match self
            .inner
            .runner
            .run(&invocation, &job.log, &job.cancel)
            .await
        {
            Ok(exit) => exit,
            Err(e) => {
                error!(error = %e, program = %invocation.program, "Failed to launch capture tool");
                return Outcome::internal(format!("{:#}", e), job.elapsed().unwrap_or_default());
            }
        };

        if exit.termination.is_cancelled() {
            return Outcome::cancelled("cancelled by operator", exit.duration);
        }

        let duration = exit.duration;
        let interpreted =
            tokio::task::spawn_blocking(move || strategy.interpret(&exit, &output_dir)).await;
        match interpreted {
            Ok(Ok(raw)) => fold_raw(raw),
            Ok(Err(e)) => Outcome::internal(format!("failed to inspect output: {:#}", e), duration),
            Err(e) => Outcome::internal(format!("output inspection failed: {}", e), duration),
        }
    }

    async fn finish(&self, job: &Arc<Job>, phase: TargetStatus, outcome: Outcome) {
        let now = Utc::now();
        job.mark_finishing();
        let status = match self.record_outcome(job, phase, &outcome, now).await {
            Ok(status) => Some(status),
            Err(e) => {
                error!(error = %e, "Failed to record crawl outcome");
                None
            }
        };

        self.inner.registry.on_complete(job.id, &outcome);

        let record = CrawlRecord {
            job_id: job.id.to_string(),
            target_id: job.target_id(),
            attempt: job.attempt,
            started_at: job.started_at().unwrap_or(job.admitted_at),
            finished_at: now,
            status: record_status(outcome.kind).to_string(),
            failure: outcome.failure_kind(),
            summary: outcome.summary.clone(),
            exit_code: outcome.exit_code,
            signal: outcome.signal,
            items: outcome.artifacts.items,
            size_bytes: outcome.artifacts.size_bytes,
            log: job.log.contents(self.inner.config.log_tail_lines),
        };
        if let Err(e) = self.inner.logs.append(&record).await {
            warn!(error = %e, "Failed to store crawl log");
        }

        info!(
            status = status.map(|s| s.as_str()).unwrap_or("unknown"),
            outcome = ?outcome.kind,
            duration_secs = outcome.duration.as_secs(),
            summary = %outcome.summary,
            "Crawl finished"
        );
        if let Some(status) = status {
            self.emit(CrawlEvent::Finished {
                target_id: job.target_id(),
                job_id: job.id,
                status,
                outcome: outcome.kind,
                summary: outcome.summary.clone(),
            });
        }
    }

    async fn record_outcome(
        &self,
        job: &Job,
        phase: TargetStatus,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<TargetStatus, CrawlError> {
        let target_id = job.target_id();
        let target = self.load(target_id).await?;

        // The persisted phase wins unless an earlier write was lost.
        let from = if target.status.is_active() {
            target.status
        } else {
            phase
        };

        let update = match state::resolve(&target, from, outcome, &self.inner.policy, now) {
            Ok(resolution) => resolution.update,
            // No sweep picks up `error`; it stays put until an operator
            // starts or resets the target.
            Err(e) => {
                error!(error = %e, "Outcome does not fit the target's lifecycle, forcing error");
                let mut update = TargetUpdate::status_only(&target, TargetStatus::Error);
                update.last_error = Some(format!("internal: {}", e));
                update.next_run_at = None;
                update
            }
        };
        let updated = self.inner.targets.update(target_id, &update).await?;

        debug!(
            status = %updated.status,
            retry_count = updated.retry_count,
            next_run_at = ?updated.next_run_at,
            "Target updated"
        );
        Ok(updated.status)
    }

    async fn fold_if_orphaned(&self, target_id: TargetId) -> Result<bool, CrawlError> {
        let fresh = self.load(target_id).await?;
        if fresh.status != TargetStatus::Crawling {
            return Ok(false);
        }
        self.fold_orphan(&fresh).await?;
        Ok(true)
    }

    /// Resolve a `crawling` record whose process is gone as a recoverable
    /// failure.
    async fn fold_orphan(&self, target: &Target) -> Result<Target, CrawlError> {
        let now = Utc::now();
        let outcome = Outcome::internal(ORPHAN_SUMMARY, Duration::ZERO);
        let resolution = state::resolve(
            target,
            TargetStatus::Crawling,
            &outcome,
            &self.inner.policy,
            now,
        )?;
        let updated = self.inner.targets.update(target.id, &resolution.update).await?;

        let record = CrawlRecord {
            job_id: Uuid::now_v7().to_string(),
            target_id: target.id,
            attempt: target.retry_count + 1,
            started_at: target.updated_at,
            finished_at: now,
            status: record_status(outcome.kind).to_string(),
            failure: Some(FailureKind::Recoverable),
            summary: outcome.summary,
            exit_code: None,
            signal: None,
            items: 0,
            size_bytes: 0,
            log: String::new(),
        };
        if let Err(e) = self.inner.logs.append(&record).await {
            warn!(target_id = target.id, error = %e, "Failed to store crawl log");
        }

        warn!(
            target_id = target.id,
            status = %updated.status,
            retry_count = updated.retry_count,
            "Recovered orphaned crawl"
        );
        Ok(updated)
    }
}

/// Turn a strategy's verdict into an outcome, classifying failures.
fn fold_raw(raw: RawOutcome) -> Outcome {
    let exit_code = raw.termination.exit_code();
    let signal = raw.termination.signal();

    if raw.success {
        return Outcome {
            kind: OutcomeKind::Success,
            exit_code,
            signal,
            summary: raw.summary,
            duration: raw.duration,
            artifacts: raw.artifacts,
        };
    }

    let classification = classifier::classify(&raw);
    debug!(rule = classification.rule, kind = classification.kind.as_str(), "Failure classified");
    Outcome {
        kind: OutcomeKind::Failure(classification.kind),
        exit_code,
        signal,
        summary: format!("{} ({})", raw.summary, classification.rule),
        duration: raw.duration,
        artifacts: raw.artifacts,
    }
}

fn record_status(kind: OutcomeKind) -> &'static str {
    match kind {
        OutcomeKind::Success => "success",
        OutcomeKind::Failure(_) => "error",
        OutcomeKind::Cancelled => "cancelled",
    }
}

/// Last `lines` lines of a stored log, without the dropped-lines header.
fn tail_of(log: &str, lines: usize) -> Vec<String> {
    let mut all: Vec<&str> = log.lines().collect();
    if all.first().is_some_and(|first| is_drop_marker(first)) {
        all.remove(0);
    }
    let skip = all.len().saturating_sub(lines);
    all[skip..].iter().map(|l| l.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ArtifactStats;
    use crate::core::runner::Termination;

    fn raw(success: bool, termination: Termination, tail: &[&str]) -> RawOutcome {
        RawOutcome {
            success,
            termination,
            zero_content: false,
            summary: termination.describe(),
            tail: tail.iter().map(|s| s.to_string()).collect(),
            duration: Duration::from_secs(3),
            artifacts: ArtifactStats::default(),
        }
    }

    #[test]
    fn failures_carry_the_rule_in_their_summary() {
        let outcome = fold_raw(raw(
            false,
            Termination::Exited { code: 8 },
            &["ERROR 404: Not Found."],
        ));
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Permanent));
        assert_eq!(outcome.summary, "exited with code 8 (not_found)");
        assert_eq!(outcome.exit_code, Some(8));
    }

    #[test]
    fn success_is_not_classified() {
        let outcome = fold_raw(raw(true, Termination::Exited { code: 0 }, &["ERROR 404"]));
        assert!(outcome.success());
    }

    #[test]
    fn tail_of_keeps_the_last_lines() {
        assert_eq!(tail_of("a\nb\nc\n", 2), vec!["b", "c"]);
        assert_eq!(tail_of("", 5), Vec::<String>::new());
    }

    #[test]
    fn tail_of_skips_the_dropped_lines_header() {
        let log = "[120 earlier lines dropped]\nSaving to: 'a.html'\nFINISHED\n";
        assert_eq!(tail_of(log, 1), vec!["FINISHED"]);
        assert_eq!(tail_of(log, 5), vec!["Saving to: 'a.html'", "FINISHED"]);
    }
}
