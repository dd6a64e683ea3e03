use thiserror::Error;

use crate::core::models::{FailureKind, JobFailure, LockKey};

/// Everything that can go wrong while triggering or running a backup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("device unreachable: {0}")]
    Connectivity(String),

    #[error("mount failed: {0}")]
    Mount(String),

    #[error("backup engine failed: {0}")]
    Subprocess(String),

    #[error("resource {0} is busy")]
    ResourceBusy(LockKey),

    #[error("job cancelled")]
    Cancelled,

    #[error("backup storage exhausted: {0}")]
    StorageExhausted(String),

    #[error("{0} not found")]
    NotFound(String),
}

impl JobError {
    /// Projection recorded on the terminal job.
    pub fn failure(&self) -> JobFailure {
        let (kind, message) = match self {
            JobError::Configuration(m) => (FailureKind::Configuration, m.clone()),
            JobError::Connectivity(m) => (FailureKind::Connectivity, m.clone()),
            JobError::Mount(m) => (FailureKind::Mount, m.clone()),
            JobError::Subprocess(m) => (FailureKind::Subprocess, m.clone()),
            JobError::StorageExhausted(m) => (FailureKind::StorageExhausted, m.clone()),
            JobError::Cancelled => (
                FailureKind::Cancelled,
                "cancelled before completion".to_string(),
            ),
            JobError::ResourceBusy(_) | JobError::NotFound(_) => {
                (FailureKind::Configuration, self.to_string())
            }
        };
        JobFailure { kind, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_keeps_kind_and_detail() {
        let failure = JobError::Connectivity("10.0.0.4:445 refused".to_string()).failure();
        assert_eq!(failure.kind, FailureKind::Connectivity);
        assert_eq!(failure.to_string(), "connectivity: 10.0.0.4:445 refused");
    }

    #[test]
    fn busy_error_names_resource() {
        let err = JobError::ResourceBusy(LockKey::new("nas", Some("docs".to_string())));
        assert_eq!(err.to_string(), "resource nas/docs is busy");
    }
}
