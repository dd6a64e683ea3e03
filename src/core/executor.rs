//! Runs one backup from lock to terminal state.
//!
//! Errors never leave the executor: every path ends in a terminal
//! `BackupJob` that is persisted before the resource lock is released.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::AppContext;
use crate::core::cascade::{self, EffectiveConfig};
use crate::core::engine::{BackupEngine, EngineError, EngineProgress, PruneRequest, SnapshotRequest};
use crate::core::error::JobError;
use crate::core::inventory::ConfigStore;
use crate::core::locks::{ResourceGuard, ResourceLocks};
use crate::core::models::{BackupJob, Device, JobRequest, JobStatus, Share};
use crate::core::plugin::PluginRegistry;
use crate::core::progress::{ProgressEvent, ProgressTracker};
use crate::core::retry::RetryCoordinator;
use crate::db::ExecutionLog;
use crate::logging::LogThrottle;

const PROGRESS_BUFFER: usize = 64;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Everything a job needs about its target, resolved fresh per execution.
struct Target {
    device: Device,
    share: Option<Share>,
    effective: EffectiveConfig,
}

pub struct JobExecutor {
    inventory: Arc<dyn ConfigStore>,
    plugins: PluginRegistry,
    engine: Arc<dyn BackupEngine>,
    progress: ProgressTracker,
    log: ExecutionLog,
    locks: ResourceLocks,
    retry: RetryCoordinator,
    wake_grace: Duration,
}

impl JobExecutor {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            inventory: ctx.inventory.clone(),
            plugins: ctx.plugins.clone(),
            engine: ctx.engine.clone(),
            progress: ctx.progress.clone(),
            log: ctx.log.clone(),
            locks: ctx.locks.clone(),
            retry: RetryCoordinator::new(),
            wake_grace: ctx.config.wake_grace(),
        }
    }

    /// Lock the request's resource and run it to completion.
    pub async fn execute(
        &self,
        request: &JobRequest,
        cancel: CancellationToken,
    ) -> Result<BackupJob, JobError> {
        let key = request.lock_key();
        let guard = self
            .locks
            .try_acquire(&key)
            .ok_or(JobError::ResourceBusy(key))?;
        Ok(self.run(BackupJob::new(request), guard, cancel).await)
    }

    /// Run a job whose resource lock is already held. The guard is dropped
    /// only after the terminal state is persisted.
    pub async fn run(
        &self,
        mut job: BackupJob,
        guard: ResourceGuard,
        cancel: CancellationToken,
    ) -> BackupJob {
        let span = info_span!(
            "backup_job",
            job_id = %job.id,
            resource = %guard.key(),
            trigger = ?job.trigger,
            attempt = job.attempt
        );

        async move {
            job.mark_running();
            self.persist(&job).await;
            info!("Backup started");

            match self.drive(&mut job, &cancel).await {
                Ok(()) => job.finish(JobStatus::Completed, None),
                Err(JobError::Cancelled) => {
                    job.finish(JobStatus::Cancelled, Some(JobError::Cancelled.failure()))
                }
                Err(e) => job.finish(JobStatus::Failed, Some(e.failure())),
            }
            job.next_retry_at = self.retry.schedule_retry(&job);
            report(&job);

            self.persist(&job).await;
            self.progress.remove(&job.id).await;
            drop(guard);
            job
        }
        .instrument(span)
        .await
    }

    /// Record a job that was cancelled before it got a concurrency slot.
    pub async fn cancel_pending(&self, mut job: BackupJob, guard: ResourceGuard) -> BackupJob {
        job.finish(JobStatus::Cancelled, Some(JobError::Cancelled.failure()));
        info!(job_id = %job.id, resource = %guard.key(), "Cancelled before start");
        self.persist(&job).await;
        drop(guard);
        job
    }

    async fn persist(&self, job: &BackupJob) {
        if let Err(e) = self.log.append(job).await {
            error!(job_id = %job.id, status = ?job.status, error = %e, "Failed to write execution log");
        }
    }

    async fn load_target(&self, job: &BackupJob) -> Result<Target, JobError> {
        let inventory_err = |e: anyhow::Error| JobError::Configuration(format!("inventory: {:#}", e));
        job.lock_key().validate().map_err(JobError::Configuration)?;

        let global = self.inventory.global_config().await.map_err(inventory_err)?;
        let device = self
            .inventory
            .device(&job.device_id)
            .await
            .map_err(inventory_err)?
            .ok_or_else(|| JobError::NotFound(format!("device '{}'", job.device_id)))?;
        if !device.enabled {
            return Err(JobError::Configuration(format!(
                "device '{}' is disabled",
                device.id
            )));
        }

        let share = match &job.share_id {
            Some(share_id) => {
                let share = self
                    .inventory
                    .list_shares(&device.id)
                    .await
                    .map_err(inventory_err)?
                    .into_iter()
                    .find(|s| &s.id == share_id)
                    .ok_or_else(|| {
                        JobError::NotFound(format!("share '{}/{}'", device.id, share_id))
                    })?;
                if !share.enabled {
                    return Err(JobError::Configuration(format!(
                        "share '{}/{}' is disabled",
                        device.id, share.id
                    )));
                }
                Some(share)
            }
            None => None,
        };

        let effective = cascade::resolve(&global, &device, share.as_ref());
        effective.validate()?;

        Ok(Target {
            device,
            share,
            effective,
        })
    }

    async fn drive(&self, job: &mut BackupJob, cancel: &CancellationToken) -> Result<(), JobError> {
        checkpoint(cancel)?;
        let target = self.load_target(job).await?;
        let device = &target.device;
        let plugin = self.plugins.for_protocol(device.protocol);

        if device.wake_on_lan.is_some() {
            match plugin.wake(device).await {
                Ok(()) => {
                    debug!(grace_secs = self.wake_grace.as_secs(), "Waiting for device to wake");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(JobError::Cancelled),
                        _ = tokio::time::sleep(self.wake_grace) => {}
                    }
                }
                Err(e) => warn!(device = %device.id, error = %e, "Wake-on-LAN failed; trying anyway"),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(JobError::Cancelled),
            reachable = plugin.test_connection(device) => {
                reachable.map_err(|e| JobError::Connectivity(e.to_string()))?
            }
        }

        let mount_point = plugin
            .mount(device, target.share.as_ref())
            .await
            .map_err(|e| JobError::Mount(e.to_string()))?;

        let outcome = self.backup_mounted(job, &target, &mount_point, cancel).await;

        if let Err(e) = plugin.unmount(&mount_point).await {
            warn!(mount_point = %mount_point.display(), error = %e, "Unmount failed");
        }
        outcome
    }

    async fn backup_mounted(
        &self,
        job: &mut BackupJob,
        target: &Target,
        mount_point: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), JobError> {
        checkpoint(cancel)?;

        let prefix = job.lock_key().archive_prefix();
        let request = SnapshotRequest {
            job_id: job.id.clone(),
            archive_name: format!("{}{}", prefix, Utc::now().format("%Y-%m-%dT%H:%M:%SZ")),
            source: mount_point.to_path_buf(),
            rules: target.effective.rules.clone(),
        };

        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let (created, last) = tokio::join!(
            self.engine.create(&request, tx, cancel.clone()),
            forward_progress(&self.progress, &job.id, rx),
        );

        if let Some(last) = last {
            job.files_processed = last.files;
            job.bytes_transferred = last.bytes;
        }
        let summary = created.map_err(engine_error)?;
        job.files_processed = summary.files;
        job.bytes_transferred = summary.bytes;
        job.snapshot = summary.snapshot.or(Some(request.archive_name));
        if summary.changed_files == 0 {
            info!("No changes since the previous snapshot");
        }

        checkpoint(cancel)?;
        let prune = PruneRequest {
            job_id: job.id.clone(),
            archive_prefix: prefix,
            retention: target.effective.retention,
        };
        self.engine
            .prune(&prune, cancel.clone())
            .await
            .map_err(|e| match e {
                EngineError::Failed(m) => JobError::Subprocess(format!("prune: {}", m)),
                other => engine_error(other),
            })
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

fn engine_error(e: EngineError) -> JobError {
    match e {
        EngineError::Cancelled => JobError::Cancelled,
        EngineError::StorageExhausted(m) => JobError::StorageExhausted(m),
        EngineError::Failed(m) => JobError::Subprocess(m),
    }
}

/// Publish engine progress in arrival order until the engine drops its sender.
async fn forward_progress(
    tracker: &ProgressTracker,
    job_id: &str,
    mut rx: mpsc::Receiver<EngineProgress>,
) -> Option<EngineProgress> {
    let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
    let mut last = None;

    while let Some(progress) = rx.recv().await {
        if throttle.should_log() {
            debug!(
                files = progress.files,
                bytes = progress.bytes,
                percent = ?progress.percent,
                "Backup progress"
            );
        }
        tracker
            .publish(ProgressEvent {
                job_id: job_id.to_string(),
                files_processed: progress.files,
                bytes_transferred: progress.bytes,
                percent: progress.percent,
                current_file: progress.current_file.clone(),
            })
            .await;
        last = Some(progress);
    }
    last
}

fn report(job: &BackupJob) {
    match (&job.status, &job.error) {
        (JobStatus::Completed, _) => info!(
            files = job.files_processed,
            bytes = job.bytes_transferred,
            snapshot = ?job.snapshot,
            "Backup completed"
        ),
        (JobStatus::Cancelled, _) => info!("Backup cancelled"),
        (_, Some(failure)) => match job.retry_summary() {
            Some(retry) => warn!(error = %failure, retry = %retry, "Backup failed"),
            None => warn!(error = %failure, "Backup failed"),
        },
        _ => {}
    }
}
