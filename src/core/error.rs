use thiserror::Error;

use crate::core::models::{TargetId, TargetStatus};
use crate::core::registry::AdmitError;
use crate::core::state::InvalidTransition;

/// Failures surfaced by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("target {0} not found")]
    TargetNotFound(TargetId),

    #[error("target {0} has an active job")]
    AlreadyActive(TargetId),

    #[error("job queue is full ({waiting} waiting)")]
    Overloaded { waiting: usize },

    #[error("target {id} cannot be started while {status}")]
    NotStartable { id: TargetId, status: TargetStatus },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl From<AdmitError> for CrawlError {
    fn from(e: AdmitError) -> Self {
        match e {
            AdmitError::AlreadyRunning(id) => Self::AlreadyActive(id),
            AdmitError::Overloaded { waiting } => Self::Overloaded { waiting },
        }
    }
}
