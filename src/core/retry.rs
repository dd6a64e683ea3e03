use chrono::{DateTime, Duration, Utc};

use crate::core::models::{BackupJob, JobStatus};

/// Retries after the original run: +5, +15, then +45 minutes.
pub const RETRY_BACKOFF_MINUTES: [i64; 3] = [5, 15, 45];

pub const MAX_RETRY_ATTEMPTS: u32 = RETRY_BACKOFF_MINUTES.len() as u32;

/// Decides whether, and when, a failed job runs again.
///
/// The follow-up itself is a one-shot deferred trigger registered with the
/// scheduler, so it passes the same overlap check as any other trigger.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCoordinator;

impl RetryCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Delay before the retry that follows a failure of `attempt`.
    pub fn backoff(attempt: u32) -> Option<Duration> {
        RETRY_BACKOFF_MINUTES
            .get(attempt as usize)
            .map(|minutes| Duration::minutes(*minutes))
    }

    /// When the failed job should be retried, or `None` if it should not be.
    pub fn schedule_retry(&self, job: &BackupJob) -> Option<DateTime<Utc>> {
        if job.status != JobStatus::Failed {
            return None;
        }
        let failure = job.error.as_ref()?;
        if !failure.kind.is_retryable() {
            return None;
        }
        let delay = Self::backoff(job.attempt)?;
        let failed_at = job.finished_at.unwrap_or_else(Utc::now);
        Some(failed_at + delay)
    }
}
