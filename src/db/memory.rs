//! In-memory stores for tests and embedding.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;

use crate::core::models::{CrawlRecord, NewTarget, Target, TargetId, TargetStatus, TargetUpdate};
use crate::core::store::{LogStore, TargetStore};

#[derive(Default)]
struct State {
    next_id: TargetId,
    targets: BTreeMap<TargetId, Target>,
    records: Vec<CrawlRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a target as-is, bypassing the lifecycle rules.
    pub fn put(&self, target: Target) {
        let mut state = self.lock();
        state.next_id = state.next_id.max(target.id);
        state.targets.insert(target.id, target);
    }

    /// Every finalized record for `target_id`, oldest first.
    pub fn records(&self, target_id: TargetId) -> Vec<CrawlRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.target_id == target_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn insert(&self, new: NewTarget) -> Result<Target> {
        let mut state = self.lock();
        state.next_id += 1;
        let target = Target::from_new(state.next_id, new, Utc::now());
        state.targets.insert(target.id, target.clone());
        Ok(target)
    }

    async fn get(&self, id: TargetId) -> Result<Option<Target>> {
        Ok(self.lock().targets.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Target>> {
        Ok(self.lock().targets.values().cloned().collect())
    }

    async fn list_by_status(&self, status: TargetStatus) -> Result<Vec<Target>> {
        Ok(self
            .lock()
            .targets
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn update(&self, id: TargetId, update: &TargetUpdate) -> Result<Target> {
        let mut state = self.lock();
        let target = state
            .targets
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Target {} not found", id))?;
        update.apply_to(target, Utc::now());
        Ok(target.clone())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append(&self, record: &CrawlRecord) -> Result<()> {
        let mut state = self.lock();
        if !state.targets.contains_key(&record.target_id) {
            return Err(anyhow!("Target {} not found", record.target_id));
        }
        state.records.push(record.clone());
        Ok(())
    }

    async fn latest(&self, target_id: TargetId) -> Result<Option<CrawlRecord>> {
        Ok(self
            .lock()
            .records
            .iter()
            .rev()
            .find(|r| r.target_id == target_id)
            .cloned())
    }
}
