//! In-memory bookkeeping of active jobs.
//!
//! The registry is the single authority on which targets have a job in
//! flight. Its lock guards only the map and the wait queue; no I/O happens
//! while it is held. Live progress is read from each job's own log buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::job::{CancelReason, Job, JobSnapshot};
use super::models::{Outcome, Target, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("target {0} already has an active job")]
    AlreadyRunning(TargetId),
    #[error("job queue is full ({waiting} waiting)")]
    Overloaded { waiting: usize },
}

/// Result of a successful `try_start`.
pub enum Admission {
    /// A worker slot was free; the job may launch immediately.
    Started(Arc<Job>),
    /// All slots are busy; the job waits at `position` (1-based).
    Queued { job: Arc<Job>, position: usize },
}

impl Admission {
    pub fn job(&self) -> &Arc<Job> {
        match self {
            Self::Started(job) => job,
            Self::Queued { job, .. } => job,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCounts {
    pub running: usize,
    pub queued: usize,
}

#[derive(Default)]
struct Inner {
    by_target: HashMap<TargetId, Arc<Job>>,
    by_job: HashMap<Uuid, TargetId>,
    waiting: VecDeque<Arc<Job>>,
    running: usize,
}

pub struct JobRegistry {
    inner: Mutex<Inner>,
    max_concurrent: usize,
    max_queued: Option<usize>,
    log_capacity: usize,
}

impl JobRegistry {
    pub fn new(max_concurrent: usize, max_queued: Option<usize>, log_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_concurrent: max_concurrent.max(1),
            max_queued,
            log_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a job for `target`. Linearizable per target: of any number of
    /// concurrent callers exactly one succeeds.
    pub fn try_start(&self, target: &Target) -> Result<Admission, AdmitError> {
        let mut inner = self.lock();

        if inner.by_target.contains_key(&target.id) {
            return Err(AdmitError::AlreadyRunning(target.id));
        }

        let has_slot = inner.running < self.max_concurrent;
        if !has_slot {
            if let Some(cap) = self.max_queued {
                if inner.waiting.len() >= cap {
                    return Err(AdmitError::Overloaded {
                        waiting: inner.waiting.len(),
                    });
                }
            }
        }

        let job = Arc::new(Job::new(target.clone(), self.log_capacity));
        inner.by_target.insert(target.id, job.clone());
        inner.by_job.insert(job.id, target.id);

        if has_slot {
            inner.running += 1;
            job.grant();
            drop(inner);
            job.notify_granted();
            debug!(target_id = target.id, job_id = %job.id, "Job admitted");
            Ok(Admission::Started(job))
        } else {
            inner.waiting.push_back(job.clone());
            let position = inner.waiting.len();
            drop(inner);
            debug!(target_id = target.id, job_id = %job.id, position, "Job queued");
            Ok(Admission::Queued { job, position })
        }
    }

    pub fn get(&self, target_id: TargetId) -> Option<Arc<Job>> {
        self.lock().by_target.get(&target_id).cloned()
    }

    pub fn contains(&self, target_id: TargetId) -> bool {
        self.lock().by_target.contains_key(&target_id)
    }

    /// Live view of a target's job. The registry lock is released before the
    /// job's log is read. A job whose outcome is being recorded is not live.
    pub fn get_status(&self, target_id: TargetId, tail_lines: usize) -> Option<JobSnapshot> {
        let job = self.get(target_id)?;
        if job.is_finishing() {
            return None;
        }
        Some(job.snapshot(tail_lines))
    }

    /// Request cancellation. Returns false when there is no active job, it is
    /// already being cancelled, or its outcome is already being recorded.
    pub fn cancel(&self, target_id: TargetId, reason: CancelReason) -> bool {
        match self.get(target_id) {
            Some(job) if !job.is_finishing() => {
                let first = job.cancel.cancel(reason);
                if first {
                    info!(target_id, job_id = %job.id, ?reason, "Cancellation requested");
                }
                first
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let jobs: Vec<_> = self.lock().by_target.values().cloned().collect();
        jobs.iter().filter(|job| job.cancel.cancel(reason)).count()
    }

    /// Remove a finished job and hand its slot to the oldest waiter.
    ///
    /// The caller records the outcome on the target before calling this, so a
    /// job is never observed inactive while its outcome is still unrecorded.
    /// Returns the jobs promoted into the freed slots.
    pub fn on_complete(&self, job_id: Uuid, outcome: &Outcome) -> Vec<Arc<Job>> {
        let mut inner = self.lock();

        let Some(target_id) = inner.by_job.remove(&job_id) else {
            return Vec::new();
        };
        let Some(job) = inner.by_target.remove(&target_id) else {
            return Vec::new();
        };

        if job.is_granted() {
            inner.running = inner.running.saturating_sub(1);
        } else {
            inner.waiting.retain(|waiting| waiting.id != job_id);
        }

        let mut promoted = Vec::new();
        while inner.running < self.max_concurrent {
            let Some(next) = inner.waiting.pop_front() else {
                break;
            };
            // A cancelled waiter finishes on its own without a slot.
            if next.cancel.is_cancelled() {
                continue;
            }
            next.grant();
            inner.running += 1;
            promoted.push(next);
        }
        drop(inner);
        job.release();

        debug!(target_id, job_id = %job_id, outcome = ?outcome.kind, "Job released");
        for next in &promoted {
            debug!(target_id = next.target_id(), job_id = %next.id, "Job promoted from queue");
            next.notify_granted();
        }
        promoted
    }

    /// All queued and running jobs, oldest admission first. Jobs whose
    /// outcome is being recorded are left out.
    pub fn list_active(&self, tail_lines: usize) -> Vec<JobSnapshot> {
        let jobs: Vec<_> = self.lock().by_target.values().cloned().collect();
        let mut snapshots: Vec<_> = jobs
            .iter()
            .filter(|job| !job.is_finishing())
            .map(|job| job.snapshot(tail_lines))
            .collect();
        snapshots.sort_by_key(|s| s.job_id);
        snapshots
    }

    pub fn counts(&self) -> RegistryCounts {
        let inner = self.lock();
        RegistryCounts {
            running: inner.running,
            queued: inner.waiting.len(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().by_target.len()
    }
}
