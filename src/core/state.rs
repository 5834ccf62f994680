//! Target lifecycle rules.
//!
//! Every status change the engine persists is computed here. The functions
//! are pure: they take the current record and an outcome and return the
//! update to write, so the transition table can be tested without a store
//! or a running process.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::AppConfig;
use crate::core::models::{FailureKind, Outcome, OutcomeKind, Target, TargetStatus, TargetUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TargetStatus,
    pub to: TargetStatus,
}

/// Check a single edge of the lifecycle graph.
pub fn check(from: TargetStatus, to: TargetStatus) -> Result<TargetStatus, InvalidTransition> {
    use TargetStatus::*;

    let allowed = match (from, to) {
        (Pending | RetryPending | Error, Queued) => true,
        (Queued, Crawling) => true,
        (Crawling, Ready) => true,
        (Crawling | Error, Dead) => true,
        // A queued job can fail before its process starts.
        (Queued | Crawling, Error) => true,
        (Error, RetryPending) => true,
        (Pending | Queued | Crawling | RetryPending | Error, Cancelled) => true,
        // New episode: recurrence, manual restart or operator reset.
        (Ready | Dead | Cancelled | RetryPending | Error, Pending) => true,
        _ => false,
    };

    if allowed {
        Ok(to)
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// Retry limits and the backoff schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: [5, 15, 45]
                .into_iter()
                .map(|m| Duration::from_secs(m * 60))
                .collect(),
        }
    }
}

impl From<&AppConfig> for RetryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config
                .backoff_minutes
                .iter()
                .map(|m| Duration::from_secs(m * 60))
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based). Past the end of the
    /// schedule the last delay repeats.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let idx = (retry.max(1) as usize - 1).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or_default()
    }
}

/// The computed result of folding an outcome into a target.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub update: TargetUpdate,
    /// Every status visited, in order, starting after `from`.
    pub path: Vec<TargetStatus>,
}

impl Resolution {
    pub fn status(&self) -> TargetStatus {
        self.update.status
    }
}

/// Fold a finished attempt into the target record.
///
/// `from` is the phase the job was in when it ended (`queued` or `crawling`),
/// which can differ from the persisted status if an earlier write failed.
pub fn resolve(
    target: &Target,
    from: TargetStatus,
    outcome: &Outcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Resolution, InvalidTransition> {
    let mut update = TargetUpdate::status_only(target, from);
    let mut path = Vec::with_capacity(2);

    match outcome.kind {
        OutcomeKind::Success => {
            path.push(check(from, TargetStatus::Ready)?);
            update.retry_count = 0;
            update.last_error = None;
            update.last_success_at = Some(now);
            update.next_run_at = target
                .recurrence_days
                .map(|days| now + chrono::Duration::days(i64::from(days)));
            update.artifacts = Some(outcome.artifacts);
        }
        OutcomeKind::Cancelled => {
            path.push(check(from, TargetStatus::Cancelled)?);
            update.next_run_at = None;
        }
        OutcomeKind::Failure(FailureKind::Permanent) => {
            path.push(check(from, TargetStatus::Dead)?);
            update.last_error = Some(outcome.summary.clone());
            update.next_run_at = None;
        }
        OutcomeKind::Failure(FailureKind::Recoverable) => {
            update.last_error = Some(outcome.summary.clone());
            if target.retry_count < policy.max_retries {
                let retry = target.retry_count + 1;
                path.push(check(from, TargetStatus::Error)?);
                path.push(check(TargetStatus::Error, TargetStatus::RetryPending)?);
                update.retry_count = retry;
                update.next_run_at = Some(now + to_chrono(policy.delay_for(retry)));
            } else {
                // Exhausted: dead straight from the running phase.
                let dead_from = if from == TargetStatus::Queued {
                    path.push(check(from, TargetStatus::Error)?);
                    TargetStatus::Error
                } else {
                    from
                };
                path.push(check(dead_from, TargetStatus::Dead)?);
                update.retry_count = target.retry_count + 1;
                update.next_run_at = None;
            }
        }
    }

    update.status = *path.last().unwrap_or(&from);
    Ok(Resolution { update, path })
}

/// Operator reset: back to `pending` with a clean retry budget.
pub fn reset(target: &Target) -> Result<TargetUpdate, InvalidTransition> {
    if target.status != TargetStatus::Pending {
        check(target.status, TargetStatus::Pending)?;
    }
    Ok(TargetUpdate {
        status: TargetStatus::Pending,
        retry_count: 0,
        last_error: None,
        next_run_at: None,
        last_success_at: target.last_success_at,
        artifacts: None,
    })
}

/// Start of a new episode for a target that is not currently runnable
/// (`ready` after a recurrence tick, `cancelled` after a manual restart).
pub fn reopen(target: &Target) -> Result<TargetUpdate, InvalidTransition> {
    let status = check(target.status, TargetStatus::Pending)?;
    let mut update = TargetUpdate::status_only(target, status);
    update.next_run_at = None;
    Ok(update)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
