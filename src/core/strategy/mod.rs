//! Capture strategies: which tool to run for a target and how to read its
//! result.
//!
//! Each method is a self-contained `CaptureStrategy`. The orchestrator only
//! ever sees the trait object, picked from a `StrategySet` by the target's
//! method.

mod channel;
mod mirror;
mod single_page;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::AppConfig;
use crate::core::models::{ArtifactStats, CaptureMethod, Target};
use crate::core::runner::{Invocation, ProcessExit, Termination};

pub use channel::ChannelStrategy;
pub use mirror::MirrorStrategy;
pub use single_page::SinglePageStrategy;

/// What a strategy makes of a finished process, before classification.
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub success: bool,
    pub termination: Termination,
    /// The tool exited as if it worked but produced nothing usable.
    pub zero_content: bool,
    pub summary: String,
    /// Last lines of tool output, oldest first.
    pub tail: Vec<String>,
    pub duration: Duration,
    pub artifacts: ArtifactStats,
}

impl RawOutcome {
    fn from_exit(exit: &ProcessExit) -> Self {
        Self {
            success: false,
            termination: exit.termination,
            zero_content: false,
            summary: exit.termination.describe(),
            tail: exit.tail.clone(),
            duration: exit.duration,
            artifacts: ArtifactStats::default(),
        }
    }
}

pub trait CaptureStrategy: Send + Sync {
    fn method(&self) -> CaptureMethod;

    /// The command line for capturing `target` into `output_dir`.
    fn build_invocation(&self, target: &Target, output_dir: &Path) -> Invocation;

    /// Read the exit status and the output area. Blocking: walks the
    /// filesystem.
    fn interpret(&self, exit: &ProcessExit, output_dir: &Path) -> Result<RawOutcome>;
}

/// One strategy per capture method.
#[derive(Clone)]
pub struct StrategySet {
    mirror: Arc<dyn CaptureStrategy>,
    channel: Arc<dyn CaptureStrategy>,
    single_page: Arc<dyn CaptureStrategy>,
}

impl StrategySet {
    pub fn new(
        mirror: Arc<dyn CaptureStrategy>,
        channel: Arc<dyn CaptureStrategy>,
        single_page: Arc<dyn CaptureStrategy>,
    ) -> Self {
        Self {
            mirror,
            channel,
            single_page,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Arc::new(MirrorStrategy::from_config(config)),
            Arc::new(ChannelStrategy::from_config(config)),
            Arc::new(SinglePageStrategy::from_config(config)),
        )
    }

    pub fn get(&self, method: CaptureMethod) -> Arc<dyn CaptureStrategy> {
        match method {
            CaptureMethod::Mirror => self.mirror.clone(),
            CaptureMethod::Channel => self.channel.clone(),
            CaptureMethod::SinglePage => self.single_page.clone(),
        }
    }
}
