//! Tracing setup for the daemon and CLI.
//!
//! Pretty console output by default, JSON lines with `json_logs = true`.
//! `RUST_LOG` overrides the level chosen here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Default level DEBUG instead of INFO.
    pub verbose: bool,
}

/// Install the global subscriber. Call once, after configuration is loaded.
/// Returns an error if a subscriber is already installed.
pub fn init(config: LogConfig) -> anyhow::Result<()> {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bkfleet={}", level.as_str().to_lowercase())));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.json {
        // Job spans carry job_id, so closing events give per-job timings.
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()?;
    }
    Ok(())
}

/// Rate limiter for chatty log lines such as per-file progress.
pub struct LogThrottle {
    interval_ms: u64,
    /// Milliseconds since `start` of the last permitted log, or `NEVER_LOGGED`.
    last_log_ms: AtomicU64,
    start: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// True at most once per interval. Safe to share between tasks.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let due = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;
        // Losing the race means another caller just logged.
        due && self
            .last_log_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn reset(&self) {
        self.last_log_ms.store(NEVER_LOGGED, Ordering::Relaxed);
    }
}
