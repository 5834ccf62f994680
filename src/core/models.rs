use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TargetId = i64;

/// How a target is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// Recursive site mirror (wget).
    Mirror,
    /// Video channel archive (yt-dlp).
    Channel,
    /// Single rendered page (single-file).
    SinglePage,
}

impl CaptureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mirror => "mirror",
            Self::Channel => "channel",
            Self::SinglePage => "single_page",
        }
    }
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mirror" => Ok(Self::Mirror),
            "channel" => Ok(Self::Channel),
            "single_page" | "single-page" => Ok(Self::SinglePage),
            other => Err(format!("unknown capture method: {}", other)),
        }
    }
}

/// Persisted lifecycle status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    Queued,
    Crawling,
    Ready,
    Error,
    RetryPending,
    Dead,
    Cancelled,
}

impl TargetStatus {
    pub const ALL: [TargetStatus; 8] = [
        Self::Pending,
        Self::Queued,
        Self::Crawling,
        Self::Ready,
        Self::Error,
        Self::RetryPending,
        Self::Dead,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Crawling => "crawling",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::RetryPending => "retry_pending",
            Self::Dead => "dead",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Dead | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Crawling)
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown target status: {}", s))
    }
}

/// Durable record of something to archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub url: String,
    pub name: String,
    pub method: CaptureMethod,
    pub status: TargetStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Recurrence interval in days. `None` disables scheduled re-crawls.
    pub recurrence_days: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub include_external: bool,
    /// Mirror recursion depth, 0 = unlimited.
    pub depth: u32,
    pub size_bytes: u64,
    pub item_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    /// A freshly registered target in `pending`.
    pub fn from_new(id: TargetId, new: NewTarget, now: DateTime<Utc>) -> Self {
        let name = new.display_name();
        Self {
            id,
            url: new.url,
            name,
            method: new.method,
            status: TargetStatus::Pending,
            retry_count: 0,
            last_error: None,
            recurrence_days: new.recurrence_days,
            next_run_at: None,
            last_success_at: None,
            include_external: new.include_external,
            depth: new.depth,
            size_bytes: 0,
            item_count: 0,
            updated_at: now,
        }
    }
}

/// Fields needed to register a new target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTarget {
    pub url: String,
    pub name: Option<String>,
    pub method: CaptureMethod,
    pub recurrence_days: Option<u32>,
    #[serde(default)]
    pub include_external: bool,
    #[serde(default)]
    pub depth: u32,
}

impl NewTarget {
    pub fn new(url: impl Into<String>, method: CaptureMethod) -> Self {
        Self {
            url: url.into(),
            name: None,
            method,
            recurrence_days: None,
            include_external: false,
            depth: 0,
        }
    }

    /// The explicit name, or the URL's host when none was given.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// The subset of target fields the engine writes back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetUpdate {
    pub status: TargetStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Artifact stats, only written when present.
    pub artifacts: Option<ArtifactStats>,
}

impl TargetUpdate {
    /// An update that only moves the status, keeping every other field.
    pub fn status_only(target: &Target, status: TargetStatus) -> Self {
        Self {
            status,
            retry_count: target.retry_count,
            last_error: target.last_error.clone(),
            next_run_at: target.next_run_at,
            last_success_at: target.last_success_at,
            artifacts: None,
        }
    }

    pub fn apply_to(&self, target: &mut Target, now: DateTime<Utc>) {
        target.status = self.status;
        target.retry_count = self.retry_count;
        target.last_error = self.last_error.clone();
        target.next_run_at = self.next_run_at;
        target.last_success_at = self.last_success_at;
        if let Some(stats) = &self.artifacts {
            target.size_bytes = stats.size_bytes;
            target.item_count = stats.items;
        }
        target.updated_at = now;
    }
}

/// Size and item count of a target's output area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStats {
    pub items: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Recoverable,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recoverable => "recoverable",
            Self::Permanent => "permanent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "failure")]
pub enum OutcomeKind {
    Success,
    Failure(FailureKind),
    Cancelled,
}

/// Result of one completed attempt.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub summary: String,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub artifacts: ArtifactStats,
}

impl Outcome {
    pub fn success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.kind {
            OutcomeKind::Failure(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn cancelled(summary: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind: OutcomeKind::Cancelled,
            exit_code: None,
            signal: None,
            summary: summary.into(),
            duration,
            artifacts: ArtifactStats::default(),
        }
    }

    /// Failure raised by the engine itself rather than the capture tool.
    pub fn internal(summary: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind: OutcomeKind::Failure(FailureKind::Recoverable),
            exit_code: None,
            signal: None,
            summary: summary.into(),
            duration,
            artifacts: ArtifactStats::default(),
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Finalized log content of one attempt, handed to the log store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRecord {
    pub job_id: String,
    pub target_id: TargetId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `success`, `error` or `cancelled`.
    pub status: String,
    pub failure: Option<FailureKind>,
    pub summary: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub items: u64,
    pub size_bytes: u64,
    pub log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in TargetStatus::ALL {
            assert_eq!(status.as_str().parse::<TargetStatus>(), Ok(status));
        }
        assert!("crawled".parse::<TargetStatus>().is_err());
    }

    #[test]
    fn method_accepts_dashed_single_page() {
        assert_eq!(
            "single-page".parse::<CaptureMethod>(),
            Ok(CaptureMethod::SinglePage)
        );
        assert_eq!(CaptureMethod::SinglePage.to_string(), "single_page");
    }

    #[test]
    fn new_target_defaults_name_to_host() {
        let new = NewTarget::new("https://www.example.org/blog/", CaptureMethod::Mirror);
        let target = Target::from_new(3, new, Utc::now());
        assert_eq!(target.name, "www.example.org");
        assert_eq!(target.status, TargetStatus::Pending);
        assert_eq!(target.retry_count, 0);

        let mut named = NewTarget::new("not a url", CaptureMethod::SinglePage);
        assert_eq!(named.display_name(), "not a url");
        named.name = Some("  Notes ".to_string());
        assert_eq!(named.display_name(), "Notes");
    }

    #[test]
    fn terminal_and_active_sets() {
        let terminal: Vec<_> = TargetStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![TargetStatus::Ready, TargetStatus::Dead, TargetStatus::Cancelled]
        );
        assert!(TargetStatus::Queued.is_active());
        assert!(TargetStatus::Crawling.is_active());
        assert!(!TargetStatus::RetryPending.is_active());
    }
}
