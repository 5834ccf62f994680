use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::config::AppConfig;
use crate::core::models::{ArtifactStats, CaptureMethod, Target};
use crate::core::runner::{Invocation, ProcessExit, Termination};
use crate::core::strategy::{CaptureStrategy, RawOutcome};

const OUTPUT_FILE: &str = "index.html";

/// One rendered page saved as a self-contained HTML file by single-file.
pub struct SinglePageStrategy {
    program: String,
    timeout: Duration,
}

impl SinglePageStrategy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            program: config.single_page.program.clone(),
            timeout: Duration::from_secs(config.single_page.timeout_secs),
        }
    }

    fn artifact(output_dir: &Path) -> PathBuf {
        output_dir.join(OUTPUT_FILE)
    }
}

impl CaptureStrategy for SinglePageStrategy {
    fn method(&self) -> CaptureMethod {
        CaptureMethod::SinglePage
    }

    fn build_invocation(&self, target: &Target, output_dir: &Path) -> Invocation {
        Invocation {
            program: self.program.clone(),
            args: vec![
                target.url.clone(),
                Self::artifact(output_dir).display().to_string(),
                "--filename-conflict-action=overwrite".to_string(),
            ],
            working_dir: Some(output_dir.to_path_buf()),
            timeout: self.timeout,
        }
    }

    fn interpret(&self, exit: &ProcessExit, output_dir: &Path) -> Result<RawOutcome> {
        let mut raw = RawOutcome::from_exit(exit);

        let Termination::Exited { code } = exit.termination else {
            return Ok(raw);
        };
        if code != 0 {
            raw.summary = format!("single-file exited with code {}", code);
            return Ok(raw);
        }

        let size = std::fs::metadata(Self::artifact(output_dir))
            .map(|m| m.len())
            .unwrap_or(0);
        if size == 0 {
            raw.zero_content = true;
            raw.summary = format!("{} is missing or empty", OUTPUT_FILE);
        } else {
            raw.success = true;
            raw.artifacts = ArtifactStats {
                items: 1,
                size_bytes: size,
            };
            raw.summary = format!("saved page ({} bytes)", size);
        }
        Ok(raw)
    }
}
