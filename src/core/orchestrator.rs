//! Facade over scheduling, dispatch and job queries.
//!
//! Every execution, whatever triggered it, goes through `dispatch`: claim
//! the resource lock, spawn a worker, wait for a concurrency slot, run. The
//! caller never waits on the execution itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::{cascade, cron};
use crate::core::error::JobError;
use crate::core::executor::JobExecutor;
use crate::core::locks::ResourceGuard;
use crate::core::models::{
    BackupJob, FailureKind, JobFailure, JobRequest, JobStatus, LockKey, check_id,
};
use crate::core::scheduler::{
    DeferredInfo, ReconcileReport, Scheduler, TriggerHandler, TriggerInfo, TriggerKey,
    TriggerSpec,
};

struct ActiveJob {
    job: BackupJob,
    cancel: CancellationToken,
}

struct Inner {
    ctx: AppContext,
    scheduler: Scheduler,
    executor: JobExecutor,
    permits: Arc<Semaphore>,
    active: Mutex<HashMap<String, ActiveJob>>,
    workers: TaskTracker,
    shutdown: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub scheduler_running: bool,
    pub scheduling_suspended: bool,
    pub locked_resources: usize,
    pub active_jobs: usize,
    pub registered_triggers: usize,
    pub pending_retries: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        let executor = JobExecutor::new(&ctx);
        let permits = Arc::new(Semaphore::new(ctx.config.max_concurrent_backups));
        Self {
            inner: Arc::new(Inner {
                ctx,
                scheduler: Scheduler::new(),
                executor,
                permits,
                active: Mutex::new(HashMap::new()),
                workers: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.inner.ctx
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Recover from the previous run, register triggers and start ticking.
    pub async fn start(&self) -> Result<()> {
        info!(
            max_concurrent = self.inner.ctx.config.max_concurrent_backups,
            simulation = self.inner.ctx.config.simulation,
            "Orchestrator starting"
        );
        self.recover_abandoned().await?;
        let report = self.reschedule_all().await?;
        info!(?report, "Triggers registered");

        let scheduler = self.inner.scheduler.clone();
        let shutdown = self.inner.shutdown.child_token();
        let period = self.inner.ctx.config.scheduler_tick();
        self.inner
            .workers
            .spawn(async move { scheduler.run(shutdown, period).await });
        Ok(())
    }

    /// Cancel everything in flight and wait for workers to record their
    /// terminal state.
    pub async fn shutdown(&self) {
        info!(active = self.active_jobs().len(), "Orchestrator shutting down");
        self.inner.shutdown.cancel();
        self.inner.workers.close();
        self.inner.workers.wait().await;
        info!("Orchestrator stopped");
    }

    /// Run a backup now. Fails synchronously if the target is unknown,
    /// misconfigured or already being backed up.
    pub async fn trigger_manual(
        &self,
        device_id: &str,
        share_id: Option<String>,
    ) -> Result<String, JobError> {
        LockKey::new(device_id, share_id.clone())
            .validate()
            .map_err(JobError::Configuration)?;

        let inventory = &self.inner.ctx.inventory;
        let inventory_err = |e: anyhow::Error| JobError::Configuration(format!("inventory: {:#}", e));

        let global = inventory.global_config().await.map_err(inventory_err)?;
        let device = inventory
            .device(device_id)
            .await
            .map_err(inventory_err)?
            .ok_or_else(|| JobError::NotFound(format!("device '{}'", device_id)))?;
        if !device.enabled {
            return Err(JobError::Configuration(format!(
                "device '{}' is disabled",
                device_id
            )));
        }
        let share = match &share_id {
            Some(id) => Some(
                inventory
                    .list_shares(device_id)
                    .await
                    .map_err(inventory_err)?
                    .into_iter()
                    .find(|s| &s.id == id)
                    .ok_or_else(|| JobError::NotFound(format!("share '{}/{}'", device_id, id)))?,
            ),
            None => None,
        };
        cascade::resolve(&global, &device, share.as_ref()).validate()?;

        self.inner.dispatch(JobRequest::manual(device_id, share_id))
    }

    /// Request cancellation. Returns `false` for unknown or finished jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.inner.active().get(job_id) {
            Some(active) => {
                info!(job_id, "Cancellation requested");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Rebuild the trigger set from the inventory.
    ///
    /// A share with its own schedule gets its own trigger. The device trigger
    /// fans out to the enabled shares that inherit its schedule, or targets
    /// the whole device when it has no shares. Entries that fail validation
    /// are skipped and logged; the rest are still registered. A device whose
    /// shares cannot be listed keeps the triggers it already had.
    pub async fn reschedule_all(&self) -> Result<ReconcileReport> {
        let inventory = &self.inner.ctx.inventory;
        let global = inventory
            .global_config()
            .await
            .context("Failed to load global configuration")?;
        let devices = inventory
            .list_devices()
            .await
            .context("Failed to list devices")?;

        let handler = self.inner.handler();
        let mut specs = Vec::new();

        for device in devices.iter().filter(|d| d.enabled) {
            if let Err(e) = check_id("device", &device.id) {
                warn!(device = %device.id, error = %e, "Device skipped");
                continue;
            }
            let shares = match inventory.list_shares(&device.id).await {
                Ok(shares) => shares,
                Err(e) => {
                    warn!(device = %device.id, error = %format!("{:#}", e), "Failed to list shares; keeping existing triggers");
                    specs.extend(self.existing_specs(&device.id, &handler));
                    continue;
                }
            };

            let mut inheriting = Vec::new();
            for share in shares.iter().filter(|s| s.enabled) {
                if let Err(e) = check_id("share", &share.id) {
                    warn!(device = %device.id, share = %share.id, error = %e, "Share skipped");
                    continue;
                }
                let effective = cascade::resolve(&global, device, Some(share));
                if let Err(e) = effective.rules.validate() {
                    warn!(device = %device.id, share = %share.id, error = %e, "Share skipped");
                    continue;
                }
                if share.overrides.schedule.is_none() {
                    inheriting.push(LockKey::new(device.id.clone(), Some(share.id.clone())));
                    continue;
                }
                match effective.cron() {
                    Ok(Some(cron)) => specs.push(TriggerSpec {
                        key: TriggerKey::share(device.id.clone(), share.id.clone()),
                        cron,
                        targets: vec![LockKey::new(device.id.clone(), Some(share.id.clone()))],
                        handler: handler.clone(),
                    }),
                    Ok(None) => debug!(device = %device.id, share = %share.id, "Share schedule disabled"),
                    Err(e) => {
                        warn!(device = %device.id, share = %share.id, error = %e, "Share trigger not registered")
                    }
                }
            }

            let targets = if shares.is_empty() {
                vec![LockKey::new(device.id.clone(), None)]
            } else {
                inheriting
            };
            if targets.is_empty() {
                continue;
            }
            match cascade::resolve(&global, device, None).cron() {
                Ok(Some(cron)) => specs.push(TriggerSpec {
                    key: TriggerKey::device(device.id.clone()),
                    cron,
                    targets,
                    handler: handler.clone(),
                }),
                Ok(None) => debug!(device = %device.id, "Device schedule disabled"),
                Err(e) => warn!(device = %device.id, error = %e, "Device trigger not registered"),
            }
        }

        Ok(self.inner.scheduler.reconcile(specs, Utc::now()))
    }

    /// Current registrations of one device, as specs that reconcile leaves
    /// unchanged.
    fn existing_specs(&self, device_id: &str, handler: &TriggerHandler) -> Vec<TriggerSpec> {
        self.inner
            .scheduler
            .triggers()
            .into_iter()
            .filter(|t| match &t.key {
                TriggerKey::Device { device_id: id } | TriggerKey::Share { device_id: id, .. } => {
                    id == device_id
                }
            })
            .filter_map(|t| {
                let cron = cron::compile(&t.cron).ok()?;
                Some(TriggerSpec {
                    key: t.key,
                    cron,
                    targets: t.targets,
                    handler: handler.clone(),
                })
            })
            .collect()
    }

    /// Lift a suspension caused by exhausted backup storage.
    pub fn resume_scheduling(&self) -> bool {
        self.inner.scheduler.resume()
    }

    /// Live state for running jobs, otherwise the latest logged state.
    pub async fn job(&self, job_id: &str) -> Result<Option<BackupJob>> {
        let live = self.inner.active().get(job_id).map(|a| a.job.clone());
        if live.is_some() {
            return Ok(live);
        }
        self.inner
            .ctx
            .log
            .get(job_id)
            .await
            .context("Failed to read execution log")
    }

    pub fn active_jobs(&self) -> Vec<BackupJob> {
        let mut jobs: Vec<BackupJob> = self
            .inner
            .active()
            .values()
            .map(|a| a.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<BackupJob>> {
        self.inner
            .ctx
            .log
            .history(limit)
            .await
            .context("Failed to read execution log")
    }

    pub fn triggers(&self) -> Vec<TriggerInfo> {
        self.inner.scheduler.triggers()
    }

    pub fn pending_retries(&self) -> Vec<DeferredInfo> {
        self.inner.scheduler.pending_retries()
    }

    pub fn health(&self) -> Health {
        Health {
            scheduler_running: self.inner.scheduler.is_running(),
            scheduling_suspended: self.inner.scheduler.is_suspended(),
            locked_resources: self.inner.ctx.locks.held_count(),
            active_jobs: self.inner.active().len(),
            registered_triggers: self.inner.scheduler.triggers().len(),
            pending_retries: self.inner.scheduler.pending_retries().len(),
        }
    }

    /// Jobs last logged as running or pending were cut off by a crash.
    /// Supersede them with a failed entry; they are not retried.
    pub async fn recover_abandoned(&self) -> Result<usize> {
        let log = &self.inner.ctx.log;
        let jobs = log.load_all().await.context("Failed to replay execution log")?;

        let mut recovered = 0;
        for mut job in jobs.into_values().filter(|j| !j.is_terminal()) {
            let was = job.status;
            job.finish(
                JobStatus::Failed,
                Some(JobFailure {
                    kind: FailureKind::Abandoned,
                    message: format!("daemon stopped while job was {:?}", was).to_lowercase(),
                }),
            );
            log.append(&job)
                .await
                .context("Failed to record abandoned job")?;
            error!(
                job_id = %job.id,
                resource = %job.lock_key(),
                started_at = ?job.started_at,
                "Job abandoned by previous run; needs operator review"
            );
            recovered += 1;
        }
        Ok(recovered)
    }
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handler for scheduled and retry triggers. Holds only a weak
    /// reference so the scheduler registry does not keep `Inner` alive.
    fn handler(self: &Arc<Self>) -> TriggerHandler {
        let weak: Weak<Inner> = Arc::downgrade(self);
        Arc::new(move |request: JobRequest| -> Result<String, JobError> {
            match weak.upgrade() {
                Some(inner) => inner.dispatch(request),
                None => Err(JobError::Cancelled),
            }
        })
    }

    fn dispatch(self: &Arc<Self>, request: JobRequest) -> Result<String, JobError> {
        if self.shutdown.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let key = request.lock_key();
        let guard = self
            .ctx
            .locks
            .try_acquire(&key)
            .ok_or(JobError::ResourceBusy(key))?;

        let job = BackupJob::new(&request);
        let job_id = job.id.clone();
        let cancel = self.shutdown.child_token();
        self.active().insert(
            job_id.clone(),
            ActiveJob {
                job: job.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(job_id = %job_id, resource = %guard.key(), trigger = ?request.trigger, "Job dispatched");

        let inner = self.clone();
        self.workers
            .spawn(async move { inner.work(job, guard, cancel).await });
        Ok(job_id)
    }

    async fn work(self: Arc<Self>, job: BackupJob, guard: ResourceGuard, cancel: CancellationToken) {
        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };

        let finished = match permit {
            Some(_permit) => {
                if let Some(active) = self.active().get_mut(&job.id) {
                    active.job.mark_running();
                }
                self.executor.run(job, guard, cancel).await
            }
            None => self.executor.cancel_pending(job, guard).await,
        };
        self.finish(finished);
    }

    fn finish(self: &Arc<Self>, job: BackupJob) {
        self.active().remove(&job.id);

        if job.error.as_ref().map(|e| e.kind) == Some(FailureKind::StorageExhausted) {
            error!(job_id = %job.id, "Backup storage exhausted; suspending scheduled backups until resumed");
            self.scheduler.suspend();
        }
        if let Some(due) = job.next_retry_at {
            self.scheduler
                .defer(due, JobRequest::retry_of(&job), self.handler());
        }
    }
}
