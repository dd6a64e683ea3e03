use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::retry::MAX_RETRY_ATTEMPTS;

/// Transfer protocol a device is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Smb,
    Ssh,
    Rsync,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smb => "smb",
            Self::Ssh => "ssh",
            Self::Rsync => "rsync",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Smb => 445,
            Self::Ssh => 22,
            Self::Rsync => 873,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wake-on-LAN settings for a device that may be asleep when a backup is due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeOnLan {
    pub mac: String,
    #[serde(default = "default_broadcast")]
    pub broadcast: String,
    #[serde(default = "default_wol_port")]
    pub port: u16,
}

fn default_broadcast() -> String {
    "255.255.255.255".to_string()
}

fn default_wol_port() -> u16 {
    9
}

fn enabled_by_default() -> bool {
    true
}

/// A backup schedule as written in configuration.
///
/// `"off"` (or `"disabled"`) turns scheduling off at that level; anything else
/// is taken as a cron expression and validated when a trigger is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Schedule {
    Disabled,
    Cron(String),
}

impl From<String> for Schedule {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("off")
            || trimmed.eq_ignore_ascii_case("disabled")
        {
            Schedule::Disabled
        } else {
            Schedule::Cron(trimmed.to_string())
        }
    }
}

impl From<Schedule> for String {
    fn from(value: Schedule) -> Self {
        match value {
            Schedule::Disabled => "off".to_string(),
            Schedule::Cron(expr) => expr,
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Disabled => f.write_str("off"),
            Schedule::Cron(expr) => f.write_str(expr),
        }
    }
}

/// Snapshot counts kept per time bucket when pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_latest: u32,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

/// Partial retention override; every count resolves on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionOverride {
    pub keep_latest: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
}

/// Fields that may be set at the global, device, or share level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub retention: RetentionOverride,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub protocol: Protocol,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub wake_on_lan: Option<WakeOnLan>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub overrides: Overrides,
}

impl Device {
    pub fn new(id: impl Into<String>, protocol: Protocol, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol,
            host: host.into(),
            port: None,
            username: None,
            password: None,
            wake_on_lan: None,
            enabled: true,
            overrides: Overrides::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub id: String,
    pub path: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub overrides: Overrides,
}

impl Share {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            enabled: true,
            overrides: Overrides::default(),
        }
    }
}

/// Key used to serialize executions: one in-flight job per (device, share).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    pub device_id: String,
    pub share_id: Option<String>,
}

/// Separates the parts of an archive name. Ids may not contain it.
pub const ARCHIVE_SEPARATOR: char = '.';

/// Stands in for the share id of whole-device targets in archive names and
/// mount points. Ids may not start with `_`, so no share can collide with it.
pub const WHOLE_DEVICE: &str = "_device";

/// Device and share ids end up in archive names and staging paths, so they
/// are limited to ASCII letters, digits, `-` and `_`, and may not start
/// with `_`.
pub fn check_id(kind: &str, id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err(format!("{} id must not be empty", kind));
    }
    if id.starts_with('_') {
        return Err(format!("{} id '{}' must not start with '_'", kind, id));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!("{} id '{}' contains invalid character '{}'", kind, id, c));
    }
    Ok(())
}

impl LockKey {
    pub fn new(device_id: impl Into<String>, share_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            share_id,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        check_id("device", &self.device_id)?;
        match &self.share_id {
            Some(share) => check_id("share", share),
            None => Ok(()),
        }
    }

    /// Every archive of this target, and no other, starts with this prefix,
    /// e.g. `nas.docs.` or `nas._device.`. Only meaningful for valid ids.
    pub fn archive_prefix(&self) -> String {
        format!(
            "{dev}{sep}{share}{sep}",
            dev = self.device_id,
            share = self.share_id.as_deref().unwrap_or(WHOLE_DEVICE),
            sep = ARCHIVE_SEPARATOR
        )
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.share_id {
            Some(share) => write!(f, "{}/{}", self.device_id, share),
            None => f.write_str(&self.device_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Category of a terminal failure, shown to operators alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Connectivity,
    Mount,
    Subprocess,
    StorageExhausted,
    Cancelled,
    Abandoned,
}

impl FailureKind {
    /// Transient failures that the retry coordinator may re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity | Self::Mount | Self::Subprocess)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Connectivity => "connectivity",
            Self::Mount => "mount",
            Self::Subprocess => "subprocess",
            Self::StorageExhausted => "storage exhausted",
            Self::Cancelled => "cancelled",
            Self::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// A request to run one backup, produced by a trigger firing or an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub device_id: String,
    pub share_id: Option<String>,
    pub trigger: TriggerKind,
    pub attempt: u32,
}

impl JobRequest {
    pub fn scheduled(target: &LockKey) -> Self {
        Self {
            device_id: target.device_id.clone(),
            share_id: target.share_id.clone(),
            trigger: TriggerKind::Scheduled,
            attempt: 0,
        }
    }

    pub fn manual(device_id: impl Into<String>, share_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            share_id,
            trigger: TriggerKind::Manual,
            attempt: 0,
        }
    }

    /// The follow-up run for a failed job, carrying the incremented attempt.
    pub fn retry_of(job: &BackupJob) -> Self {
        Self {
            device_id: job.device_id.clone(),
            share_id: job.share_id.clone(),
            trigger: TriggerKind::Retry,
            attempt: job.attempt + 1,
        }
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::new(self.device_id.clone(), self.share_id.clone())
    }
}

/// One backup execution. Serialized as-is into the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub device_id: String,
    pub share_id: Option<String>,
    pub trigger: TriggerKind,
    pub status: JobStatus,
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files_processed: u64,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub error: Option<JobFailure>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl BackupJob {
    pub fn new(request: &JobRequest) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            device_id: request.device_id.clone(),
            share_id: request.share_id.clone(),
            trigger: request.trigger,
            status: JobStatus::Pending,
            attempt: request.attempt,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            files_processed: 0,
            bytes_transferred: 0,
            snapshot: None,
            error: None,
            next_retry_at: None,
        }
    }

    pub fn lock_key(&self) -> LockKey {
        LockKey::new(self.device_id.clone(), self.share_id.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Move the job into its terminal state. Has no effect once terminal.
    pub fn finish(&mut self, status: JobStatus, error: Option<JobFailure>) {
        if self.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    /// Operator-facing retry state, e.g. "retry 1 of 3 scheduled at ...".
    pub fn retry_summary(&self) -> Option<String> {
        if self.status != JobStatus::Failed {
            return None;
        }
        match self.next_retry_at {
            Some(at) => Some(format!(
                "retry {} of {} scheduled at {}",
                self.attempt + 1,
                MAX_RETRY_ATTEMPTS,
                at.to_rfc3339()
            )),
            None if self.attempt >= MAX_RETRY_ATTEMPTS => Some(format!(
                "permanently failed after {} retries",
                MAX_RETRY_ATTEMPTS
            )),
            None if self.attempt > 0 => Some(format!(
                "failed on retry {} of {}; not retried",
                self.attempt, MAX_RETRY_ATTEMPTS
            )),
            None => Some("failed; not retried".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_prefixes_do_not_overlap() {
        let docs = LockKey::new("nas", Some("docs".to_string()));
        let prefix = docs.archive_prefix();
        assert_eq!(prefix, "nas.docs.");

        let others = [
            LockKey::new("nas", Some("docs-old".to_string())),
            LockKey::new("nas-docs", None),
            LockKey::new("nas", None),
            LockKey::new("nas-docs", Some("x".to_string())),
        ];
        for other in others {
            let archive = format!("{}2026-01-01T00:00:00Z", other.archive_prefix());
            assert!(!archive.starts_with(&prefix), "{} overlaps {}", archive, prefix);
        }
    }

    #[test]
    fn ids_with_separator_or_reserved_prefix_are_rejected() {
        assert!(check_id("share", "docs-old_2").is_ok());
        assert!(check_id("device", "nas.local").is_err());
        assert!(check_id("share", "_device").is_err());
        assert!(check_id("share", "a/b").is_err());
        assert!(check_id("device", "").is_err());

        assert!(LockKey::new("nas", Some("docs".to_string())).validate().is_ok());
        assert!(LockKey::new("nas", Some("do cs".to_string())).validate().is_err());
    }

    #[test]
    fn schedule_off_spellings_disable() {
        assert_eq!(Schedule::from("off".to_string()), Schedule::Disabled);
        assert_eq!(Schedule::from("Disabled".to_string()), Schedule::Disabled);
        assert_eq!(
            Schedule::from(" 0 2 * * * ".to_string()),
            Schedule::Cron("0 2 * * *".to_string())
        );
    }

    #[test]
    fn lock_key_display() {
        assert_eq!(LockKey::new("nas", None).to_string(), "nas");
        assert_eq!(
            LockKey::new("nas", Some("photos".to_string())).to_string(),
            "nas/photos"
        );
    }

    #[test]
    fn finish_is_one_shot() {
        let mut job = BackupJob::new(&JobRequest::manual("nas", None));
        job.mark_running();
        job.finish(JobStatus::Completed, None);
        job.finish(
            JobStatus::Failed,
            Some(JobFailure {
                kind: FailureKind::Subprocess,
                message: "late".to_string(),
            }),
        );
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[test]
    fn retry_summary_reports_exhaustion() {
        let mut job = BackupJob::new(&JobRequest::manual("nas", None));
        job.attempt = MAX_RETRY_ATTEMPTS;
        job.finish(
            JobStatus::Failed,
            Some(JobFailure {
                kind: FailureKind::Connectivity,
                message: "unreachable".to_string(),
            }),
        );
        assert_eq!(
            job.retry_summary().as_deref(),
            Some("permanently failed after 3 retries")
        );
    }

    #[test]
    fn retry_request_increments_attempt() {
        let mut job = BackupJob::new(&JobRequest::manual("nas", Some("docs".to_string())));
        job.attempt = 1;
        let retry = JobRequest::retry_of(&job);
        assert_eq!(retry.trigger, TriggerKind::Retry);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.lock_key(), job.lock_key());
    }
}
