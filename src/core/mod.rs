pub mod artifacts;
pub mod classifier;
pub mod error;
pub mod job;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod strategy;

pub use error::CrawlError;
pub use job::{CancelReason, Job, JobLog, JobSnapshot};
pub use models::{
    ArtifactStats, CaptureMethod, CrawlRecord, FailureKind, NewTarget, Outcome, OutcomeKind,
    Target, TargetId, TargetStatus, TargetUpdate,
};
pub use orchestrator::{CrawlEvent, Orchestrator, RecoveryReport, StartOutcome, StatusReport};
pub use registry::{AdmitError, JobRegistry, RegistryCounts};
pub use scheduler::{Scheduler, SweepKind, SweepReport};
pub use store::{LogStore, TargetStore};
