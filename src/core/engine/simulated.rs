use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::engine::{
    BackupEngine, EngineError, EngineFuture, EngineProgress, EngineSummary, PruneRequest,
    SnapshotRequest,
};

/// How a simulated `create` run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedOutcome {
    Success,
    /// Exits mid-transfer without a summary.
    Crash,
    StorageExhausted,
    /// Emits progress, then waits until cancelled.
    Hang,
}

#[derive(Debug)]
struct SimState {
    outcome: SimulatedOutcome,
    prune_fails: bool,
    /// Archive names in creation order, standing in for the repository.
    archives: Vec<String>,
}

/// In-process engine used for `simulation = true` and tests.
#[derive(Clone)]
pub struct SimulatedEngine {
    files: u64,
    bytes_per_file: u64,
    step_delay: Duration,
    state: Arc<Mutex<SimState>>,
    creates: Arc<AtomicU64>,
    prunes: Arc<AtomicU64>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            files: 10,
            bytes_per_file: 4096,
            step_delay: Duration::from_millis(20),
            state: Arc::new(Mutex::new(SimState {
                outcome: SimulatedOutcome::Success,
                prune_fails: false,
                archives: Vec::new(),
            })),
            creates: Arc::new(AtomicU64::new(0)),
            prunes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_files(mut self, files: u64) -> Self {
        self.files = files;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_outcome(self, outcome: SimulatedOutcome) -> Self {
        self.set_outcome(outcome);
        self
    }

    /// Change the outcome of subsequent runs.
    pub fn set_outcome(&self, outcome: SimulatedOutcome) {
        if let Ok(mut state) = self.state.lock() {
            state.outcome = outcome;
        }
    }

    pub fn set_prune_fails(&self, fails: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.prune_fails = fails;
        }
    }

    pub fn create_calls(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn prune_calls(&self) -> u64 {
        self.prunes.load(Ordering::SeqCst)
    }

    /// Archives currently held in the simulated repository, oldest first.
    pub fn archives(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.archives.clone())
            .unwrap_or_default()
    }

    fn outcome(&self) -> SimulatedOutcome {
        self.state
            .lock()
            .map(|s| s.outcome.clone())
            .unwrap_or(SimulatedOutcome::Success)
    }

    fn prune_fails(&self) -> bool {
        self.state.lock().map(|s| s.prune_fails).unwrap_or(false)
    }
}

impl BackupEngine for SimulatedEngine {
    fn create(
        &self,
        req: &SnapshotRequest,
        tx: mpsc::Sender<EngineProgress>,
        cancel: CancellationToken,
    ) -> EngineFuture<EngineSummary> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcome();
        let files = self.files;
        let bytes_per_file = self.bytes_per_file;
        let delay = self.step_delay;
        let archive = req.archive_name.clone();
        let source = req.source.clone();
        let state = self.state.clone();

        Box::pin(async move {
            info!(archive = %archive, source = %source.display(), ?outcome, "Simulated backup starting");

            let stop_at = match outcome {
                SimulatedOutcome::Crash | SimulatedOutcome::StorageExhausted => files / 2,
                _ => files,
            };

            for i in 1..=stop_at {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                let _ = tx
                    .send(EngineProgress {
                        files: i,
                        bytes: i * bytes_per_file,
                        percent: Some(i as f64 * 100.0 / files.max(1) as f64),
                        current_file: Some(format!("file-{i:04}.dat")),
                    })
                    .await;
            }

            match outcome {
                SimulatedOutcome::Success => {
                    if let Ok(mut state) = state.lock() {
                        state.archives.push(archive.clone());
                    }
                    Ok(EngineSummary {
                        files,
                        bytes: files * bytes_per_file,
                        changed_files: files,
                        snapshot: Some(archive),
                    })
                }
                SimulatedOutcome::Crash => Err(EngineError::Failed(
                    "engine exited (exit status: 2): simulated crash".to_string(),
                )),
                SimulatedOutcome::StorageExhausted => Err(EngineError::StorageExhausted(
                    "No space left on device".to_string(),
                )),
                SimulatedOutcome::Hang => {
                    cancel.cancelled().await;
                    Err(EngineError::Cancelled)
                }
            }
        })
    }

    /// Keeps the newest `keep_latest` archives under the prefix; the time
    /// buckets are not simulated.
    fn prune(&self, req: &PruneRequest, cancel: CancellationToken) -> EngineFuture<()> {
        self.prunes.fetch_add(1, Ordering::SeqCst);
        let fails = self.prune_fails();
        let delay = self.step_delay;
        let state = self.state.clone();
        let prefix = req.archive_prefix.clone();
        let keep = req.retention.keep_latest as usize;

        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            if fails {
                return Err(EngineError::Failed("simulated prune failure".to_string()));
            }
            if let Ok(mut state) = state.lock() {
                let matching = state.archives.iter().filter(|a| a.starts_with(&prefix)).count();
                let mut excess = matching.saturating_sub(keep);
                state.archives.retain(|a| {
                    if excess > 0 && a.starts_with(&prefix) {
                        excess -= 1;
                        false
                    } else {
                        true
                    }
                });
            }
            Ok(())
        })
    }
}
