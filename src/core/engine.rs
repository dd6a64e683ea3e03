//! Backup engine seam.
//!
//! The engine is an external process that snapshots a directory into a
//! repository and prunes old snapshots. It reports progress as one JSON
//! object per stdout line:
//!
//! ```text
//! {"type":"progress","files":12,"bytes":40960,"percent":8.5,"current_file":"a/b.jpg"}
//! {"type":"error","message":"No space left on device","kind":"storage_exhausted"}
//! {"type":"summary","files":140,"bytes":524288,"changed_files":0,"snapshot":"nas.docs...."}
//! ```

mod simulated;
mod subprocess;

pub use simulated::{SimulatedEngine, SimulatedOutcome};
pub use subprocess::{EventStream, SubprocessEngine, parse_event_line};

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::cascade::PatternRules;
use crate::core::models::RetentionPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineProgress {
    #[serde(default)]
    pub files: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub current_file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSummary {
    pub files: u64,
    pub bytes: u64,
    #[serde(default)]
    pub changed_files: u64,
    #[serde(default)]
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFailure {
    pub message: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// One parsed line of engine output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Progress(EngineProgress),
    Summary(EngineSummary),
    Error(EngineFailure),
}

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub job_id: String,
    pub archive_name: String,
    pub source: PathBuf,
    pub rules: PatternRules,
}

#[derive(Debug, Clone)]
pub struct PruneRequest {
    pub job_id: String,
    pub archive_prefix: String,
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine run cancelled")]
    Cancelled,
    #[error("backup storage exhausted: {0}")]
    StorageExhausted(String),
    #[error("{0}")]
    Failed(String),
}

pub type EngineFuture<T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send>>;

pub trait BackupEngine: Send + Sync {
    /// Snapshot `req.source`, sending progress in emission order on `tx`.
    /// Resolves to the engine's terminal summary.
    fn create(
        &self,
        req: &SnapshotRequest,
        tx: mpsc::Sender<EngineProgress>,
        cancel: CancellationToken,
    ) -> EngineFuture<EngineSummary>;

    /// Delete snapshots under `req.archive_prefix` that the policy no longer keeps.
    fn prune(&self, req: &PruneRequest, cancel: CancellationToken) -> EngineFuture<()>;
}
