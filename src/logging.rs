//! Logging and tracing initialization for archivd.
//!
//! Structured logging through the `tracing` ecosystem, with pretty console
//! output for operators and JSON output for log aggregation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

/// Configuration for the logging system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the verbose flag. Calling this twice is
/// harmless; the second call leaves the first subscriber in place.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("archivd={}", default_level.as_str().to_lowercase()))
    });

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

/// Samples a noisy line stream for the debug log. A capture tool can emit
/// thousands of progress lines; one is echoed per `interval` and the rest are
/// counted so the echoed line can say how many were skipped.
pub struct EchoSampler {
    interval_ms: u64,
    /// Ms since `origin` of the last echo, `UNSET` before the first
    last_echo_ms: AtomicU64,
    skipped: AtomicU64,
    origin: Instant,
}

const UNSET: u64 = u64::MAX;

impl EchoSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            last_echo_ms: AtomicU64::new(UNSET),
            skipped: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    /// `Some(skipped)` when this line should be echoed, where `skipped` is the
    /// number of lines swallowed since the previous echo.
    pub fn sample(&self) -> Option<u64> {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        let last = self.last_echo_ms.load(Ordering::Relaxed);
        let due = last == UNSET || elapsed.saturating_sub(last) >= self.interval_ms;

        if due
            && self
                .last_echo_ms
                .compare_exchange(last, elapsed, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Some(self.skipped.swap(0, Ordering::Relaxed));
        }
        self.skipped.fetch_add(1, Ordering::Relaxed);
        None
    }
}
