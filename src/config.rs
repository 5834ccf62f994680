use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::CaptureMethod;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/archivd/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub archive_root: PathBuf,
    pub rpc_bind: SocketAddr,
    pub verbose: bool,
    pub json_logs: bool,
    pub max_concurrent_jobs: usize,
    /// Hard cap on jobs waiting for a slot. Unbounded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queued_jobs: Option<usize>,
    pub max_retries: u32,
    pub backoff_minutes: Vec<u64>,
    pub log_buffer_lines: usize,
    pub log_tail_lines: usize,
    pub kill_grace_secs: u64,
    pub sweeps: SweepConfig,
    pub mirror: MirrorConfig,
    pub channel: MethodConfig,
    pub single_page: MethodConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub retry_secs: u64,
    pub recurrence_secs: u64,
    pub stuck_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodConfig {
    pub program: String,
    pub timeout_secs: u64,
    pub stuck_threshold_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    #[serde(flatten)]
    pub tool: MethodConfig,
    /// Upper bound on requests per second sent to the mirrored host.
    pub requests_per_second: f64,
    /// Recursion depth for targets that do not set one. 0 = unlimited.
    pub max_depth: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/archivd/archivd.db"),
            archive_root: PathBuf::from("/var/lib/archivd/mirrors"),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7433)),
            verbose: false,
            json_logs: false,
            max_concurrent_jobs: 4,
            max_queued_jobs: None,
            max_retries: 3,
            backoff_minutes: vec![5, 15, 45],
            log_buffer_lines: 2000,
            log_tail_lines: 200,
            kill_grace_secs: 10,
            sweeps: SweepConfig::default(),
            mirror: MirrorConfig::default(),
            channel: MethodConfig {
                program: "yt-dlp".to_string(),
                timeout_secs: 12 * 3600,
                stuck_threshold_secs: 2 * 3600,
            },
            single_page: MethodConfig {
                program: "single-file".to_string(),
                timeout_secs: 5 * 60,
                stuck_threshold_secs: 10 * 60,
            },
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            retry_secs: 5 * 60,
            recurrence_secs: 3600,
            stuck_secs: 30 * 60,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            tool: MethodConfig {
                program: "wget".to_string(),
                timeout_secs: 6 * 3600,
                stuck_threshold_secs: 2 * 3600,
            },
            requests_per_second: 2.0,
            max_depth: 0,
        }
    }
}

impl Default for MethodConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            timeout_secs: 3600,
            stuck_threshold_secs: 3600,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `ARCHIVD_*` environment variables and
    /// CLI overrides, in that order.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("ARCHIVD_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", file.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be at least 1");
        }
        if self.backoff_minutes.is_empty() {
            anyhow::bail!("backoff_minutes must contain at least one delay");
        }
        if self.mirror.requests_per_second <= 0.0 {
            anyhow::bail!("mirror.requests_per_second must be positive");
        }
        Ok(())
    }

    pub fn method(&self, method: CaptureMethod) -> &MethodConfig {
        match method {
            CaptureMethod::Mirror => &self.mirror.tool,
            CaptureMethod::Channel => &self.channel,
            CaptureMethod::SinglePage => &self.single_page,
        }
    }

    pub fn method_mut(&mut self, method: CaptureMethod) -> &mut MethodConfig {
        match method {
            CaptureMethod::Mirror => &mut self.mirror.tool,
            CaptureMethod::Channel => &mut self.channel,
            CaptureMethod::SinglePage => &mut self.single_page,
        }
    }

    pub fn stuck_threshold(&self, method: CaptureMethod) -> Duration {
        Duration::from_secs(self.method(method).stuck_threshold_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn output_dir(&self, target_id: i64) -> PathBuf {
        self.archive_root.join(target_id.to_string())
    }
}
