use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::config::AppConfig;
use crate::core::artifacts::{has_extension, scan_tree, subdirectories};
use crate::core::models::{ArtifactStats, CaptureMethod, Target};
use crate::core::runner::{Invocation, ProcessExit, Termination};
use crate::core::strategy::{CaptureStrategy, RawOutcome};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv"];
const ARCHIVE_FILE: &str = "downloaded.txt";

/// Channel or playlist archive using yt-dlp, one directory per video.
pub struct ChannelStrategy {
    program: String,
    timeout: Duration,
}

impl ChannelStrategy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            program: config.channel.program.clone(),
            timeout: Duration::from_secs(config.channel.timeout_secs),
        }
    }
}

/// A directory holds a complete item once both the video and its metadata
/// sidecar are present.
fn is_complete_item(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    let mut video = false;
    let mut info = false;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".info.json") {
            info = true;
        } else if has_extension(&path, VIDEO_EXTENSIONS) {
            video = true;
        }
    }
    video && info
}

fn count_items(output_dir: &Path) -> Result<u64> {
    Ok(subdirectories(output_dir)?
        .iter()
        .filter(|dir| is_complete_item(dir))
        .count() as u64)
}

impl CaptureStrategy for ChannelStrategy {
    fn method(&self) -> CaptureMethod {
        CaptureMethod::Channel
    }

    fn build_invocation(&self, target: &Target, output_dir: &Path) -> Invocation {
        let template = output_dir.join("%(id)s").join("%(title)s [%(id)s].%(ext)s");
        let args = vec![
            "--format".to_string(),
            "bestvideo[height<=1080]+bestaudio/best[height<=1080]/best".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--write-info-json".to_string(),
            "--write-thumbnail".to_string(),
            "--convert-thumbnails".to_string(),
            "jpg".to_string(),
            "--embed-thumbnail".to_string(),
            "--add-metadata".to_string(),
            "--restrict-filenames".to_string(),
            "--no-overwrites".to_string(),
            "--ignore-errors".to_string(),
            "--newline".to_string(),
            "--sleep-interval".to_string(),
            "2".to_string(),
            "--max-sleep-interval".to_string(),
            "5".to_string(),
            "--download-archive".to_string(),
            output_dir.join(ARCHIVE_FILE).display().to_string(),
            "--output".to_string(),
            template.display().to_string(),
            target.url.clone(),
        ];

        Invocation {
            program: self.program.clone(),
            args,
            working_dir: Some(output_dir.to_path_buf()),
            timeout: self.timeout,
        }
    }

    fn interpret(&self, exit: &ProcessExit, output_dir: &Path) -> Result<RawOutcome> {
        let mut raw = RawOutcome::from_exit(exit);

        let Termination::Exited { code } = exit.termination else {
            return Ok(raw);
        };

        let items = count_items(output_dir)?;
        match (code, items) {
            (0, 0) => {
                raw.zero_content = true;
                raw.summary = "yt-dlp finished without downloading any items".to_string();
            }
            // --ignore-errors: 1 means some items failed.
            (0 | 1, _) => {
                let scan = scan_tree(output_dir)?;
                raw.success = true;
                raw.artifacts = ArtifactStats {
                    items,
                    size_bytes: scan.total_bytes,
                };
                raw.summary = if code == 0 {
                    format!("archived {} items ({} bytes)", items, scan.total_bytes)
                } else {
                    format!(
                        "archived {} items ({} bytes), some items failed",
                        items, scan.total_bytes
                    )
                };
            }
            _ => {
                raw.summary = format!("yt-dlp exited with code {}", code);
            }
        }
        Ok(raw)
    }
}
