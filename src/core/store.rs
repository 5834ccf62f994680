//! Persistence seams used by the engine.
//!
//! The engine never talks to SQLite directly. `db::SqliteStore` implements
//! both traits for the daemon, `db::MemoryStore` for tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::models::{CrawlRecord, NewTarget, Target, TargetId, TargetStatus, TargetUpdate};

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn insert(&self, new: NewTarget) -> Result<Target>;

    async fn get(&self, id: TargetId) -> Result<Option<Target>>;

    async fn list(&self) -> Result<Vec<Target>>;

    async fn list_by_status(&self, status: TargetStatus) -> Result<Vec<Target>>;

    /// Write the engine-owned fields and return the updated record.
    async fn update(&self, id: TargetId, update: &TargetUpdate) -> Result<Target>;

    /// `retry_pending` targets whose backoff has elapsed.
    async fn list_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<Target>> {
        let targets = self.list_by_status(TargetStatus::RetryPending).await?;
        Ok(targets
            .into_iter()
            .filter(|t| t.next_run_at.is_some_and(|at| at <= now))
            .collect())
    }

    /// `ready` targets whose recurrence interval has elapsed since their last
    /// successful run.
    async fn list_due_recurrences(&self, now: DateTime<Utc>) -> Result<Vec<Target>> {
        let targets = self.list_by_status(TargetStatus::Ready).await?;
        Ok(targets.into_iter().filter(|t| recurrence_due(t, now)).collect())
    }
}

pub fn recurrence_due(target: &Target, now: DateTime<Utc>) -> bool {
    match (target.recurrence_days, target.last_success_at) {
        (Some(days), Some(last)) => last + chrono::Duration::days(i64::from(days)) <= now,
        _ => false,
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, record: &CrawlRecord) -> Result<()>;

    /// Most recent finalized record for a target.
    async fn latest(&self, target_id: TargetId) -> Result<Option<CrawlRecord>>;
}
