use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::config::AppConfig;
use crate::core::artifacts::scan_tree;
use crate::core::models::{ArtifactStats, CaptureMethod, Target};
use crate::core::runner::{Invocation, ProcessExit, Termination};
use crate::core::strategy::{CaptureStrategy, RawOutcome};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const REJECT_FILES: &str = "*.exe,*.zip,*.tar.gz,*.rar,*.7z,*.iso,*.dmg";
const REJECT_URLS: &str = "(logout|signout|login|signin|auth|session)";

/// "Server issued an error response": some pages failed, the rest is usable.
const EXIT_SERVER_ERROR: i32 = 8;

/// Recursive site mirror using wget.
pub struct MirrorStrategy {
    program: String,
    timeout: Duration,
    requests_per_second: f64,
    max_depth: u32,
}

impl MirrorStrategy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            program: config.mirror.tool.program.clone(),
            timeout: Duration::from_secs(config.mirror.tool.timeout_secs),
            requests_per_second: config.mirror.requests_per_second,
            max_depth: config.mirror.max_depth,
        }
    }

    fn wait_secs(&self) -> String {
        let wait = 1.0 / self.requests_per_second;
        let formatted = format!("{:.3}", wait);
        formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }
}

/// wget's documented exit statuses.
pub fn describe_exit(code: i32) -> &'static str {
    match code {
        0 => "no problems occurred",
        1 => "generic error",
        2 => "parse error",
        3 => "file I/O error",
        4 => "network failure",
        5 => "SSL verification failure",
        6 => "authentication failure",
        7 => "protocol error",
        8 => "server issued an error response",
        _ => "unknown error",
    }
}

impl CaptureStrategy for MirrorStrategy {
    fn method(&self) -> CaptureMethod {
        CaptureMethod::Mirror
    }

    fn build_invocation(&self, target: &Target, output_dir: &Path) -> Invocation {
        let mut args: Vec<String> = [
            "--mirror",
            "--convert-links",
            "--adjust-extension",
            "--page-requisites",
            "--no-parent",
            "--no-verbose",
            "--random-wait",
            "--tries=3",
            "--timeout=30",
            "--execute=robots=off",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        args.push(format!("--wait={}", self.wait_secs()));
        args.push(format!("--user-agent={}", USER_AGENT));
        args.push(format!("--directory-prefix={}", output_dir.display()));

        let depth = if target.depth > 0 {
            target.depth
        } else {
            self.max_depth
        };
        if depth > 0 {
            args.push(format!("--level={}", depth));
        }

        if target.include_external {
            // Without a host there is nothing to bound the span to.
            if let Some(host) = url::Url::parse(&target.url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
            {
                args.push("--span-hosts".to_string());
                args.push(format!("--domains={}", host));
            }
        }

        args.extend([
            "--reject".to_string(),
            REJECT_FILES.to_string(),
            "--reject-regex".to_string(),
            REJECT_URLS.to_string(),
            target.url.clone(),
        ]);

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

        if code != 0 && code != EXIT_SERVER_ERROR {
            raw.summary = format!("wget exited with {} ({})", code, describe_exit(code));
            return Ok(raw);
        }

        let scan = scan_tree(output_dir)?;
        if scan.files.is_empty() {
            raw.zero_content = true;
            raw.summary = format!("wget exited with {} but wrote no files", code);
            return Ok(raw);
        }

        let pages = scan.count_with_extension(&["html", "htm"]);
        raw.success = true;
        raw.artifacts = ArtifactStats {
            items: pages,
            size_bytes: scan.total_bytes,
        };
        raw.summary = if code == EXIT_SERVER_ERROR {
            format!(
                "mirrored {} pages ({} bytes), some requests failed",
                pages, scan.total_bytes
            )
        } else {
            format!("mirrored {} pages ({} bytes)", pages, scan.total_bytes)
        };
        Ok(raw)
    }
}
