//! Cron triggers and one-shot deferred triggers.
//!
//! Each registered trigger maps a key to a compiled cron expression, the lock
//! keys it fans out to and a handler closure built at registration time. A
//! tick fires every due trigger once per target; a target whose handler
//! reports it busy is skipped for that firing and never queued. The tick
//! itself never waits on an execution.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::cron::CronExpr;
use crate::core::error::JobError;
use crate::core::models::{JobRequest, LockKey};

/// Starts one execution and returns its job id. Must not block.
pub type TriggerHandler = Arc<dyn Fn(JobRequest) -> Result<String, JobError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum TriggerKey {
    Device { device_id: String },
    Share { device_id: String, share_id: String },
}

impl TriggerKey {
    pub fn device(device_id: impl Into<String>) -> Self {
        Self::Device {
            device_id: device_id.into(),
        }
    }

    pub fn share(device_id: impl Into<String>, share_id: impl Into<String>) -> Self {
        Self::Share {
            device_id: device_id.into(),
            share_id: share_id.into(),
        }
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device { device_id } => write!(f, "device:{}", device_id),
            Self::Share {
                device_id,
                share_id,
            } => write!(f, "share:{}/{}", device_id, share_id),
        }
    }
}

/// Desired state of one trigger, as computed by a scheduling pass.
pub struct TriggerSpec {
    pub key: TriggerKey,
    pub cron: CronExpr,
    pub targets: Vec<LockKey>,
    pub handler: TriggerHandler,
}

struct Registration {
    cron: CronExpr,
    targets: Vec<LockKey>,
    next_fire: Option<DateTime<Utc>>,
    handler: TriggerHandler,
}

struct Deferred {
    due: DateTime<Utc>,
    request: JobRequest,
    handler: TriggerHandler,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerInfo {
    pub key: TriggerKey,
    pub cron: String,
    pub targets: Vec<LockKey>,
    pub next_fire: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeferredInfo {
    pub device_id: String,
    pub share_id: Option<String>,
    pub attempt: u32,
    pub due: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Cron triggers that came due.
    pub fired: usize,
    /// Deferred triggers that came due.
    pub deferred_fired: usize,
    pub dispatched: usize,
    pub skipped_busy: usize,
    /// Firings dropped because scheduling is suspended.
    pub suppressed: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct Scheduler {
    registry: Arc<RwLock<HashMap<TriggerKey, Registration>>>,
    deferred: Arc<Mutex<Vec<Deferred>>>,
    running: Arc<AtomicBool>,
    suspended: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the registry match `specs`. Triggers whose expression is
    /// unchanged keep their next fire time; new or changed ones are computed
    /// from `now`; triggers absent from `specs` are removed.
    pub fn reconcile(&self, specs: Vec<TriggerSpec>, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);

        let wanted: Vec<TriggerKey> = specs.iter().map(|s| s.key.clone()).collect();
        let before = registry.len();
        registry.retain(|key, _| wanted.contains(key));
        report.removed = before - registry.len();

        for spec in specs {
            match registry.get_mut(&spec.key) {
                Some(existing) if existing.cron.as_str() == spec.cron.as_str() => {
                    if existing.targets == spec.targets {
                        report.unchanged += 1;
                    } else {
                        report.updated += 1;
                    }
                    existing.targets = spec.targets;
                    existing.handler = spec.handler;
                }
                existing => {
                    let next_fire = spec.cron.next_after(&now);
                    if existing.is_some() {
                        report.updated += 1;
                    } else {
                        report.added += 1;
                    }
                    info!(trigger = %spec.key, cron = %spec.cron, next_fire = ?next_fire, "Trigger scheduled");
                    registry.insert(
                        spec.key,
                        Registration {
                            cron: spec.cron,
                            targets: spec.targets,
                            next_fire,
                            handler: spec.handler,
                        },
                    );
                }
            }
        }

        debug!(?report, "Triggers reconciled");
        report
    }

    pub fn remove(&self, key: &TriggerKey) -> bool {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Fire `request` once at `due`.
    pub fn defer(&self, due: DateTime<Utc>, request: JobRequest, handler: TriggerHandler) {
        info!(
            resource = %request.lock_key(),
            attempt = request.attempt,
            due = %due,
            "Deferred trigger registered"
        );
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Deferred {
                due,
                request,
                handler,
            });
    }

    pub fn triggers(&self) -> Vec<TriggerInfo> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<TriggerInfo> = registry
            .iter()
            .map(|(key, reg)| TriggerInfo {
                key: key.clone(),
                cron: reg.cron.to_string(),
                targets: reg.targets.clone(),
                next_fire: reg.next_fire,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn pending_retries(&self) -> Vec<DeferredInfo> {
        let deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<DeferredInfo> = deferred
            .iter()
            .map(|d| DeferredInfo {
                device_id: d.request.device_id.clone(),
                share_id: d.request.share_id.clone(),
                attempt: d.request.attempt,
                due: d.due,
            })
            .collect();
        out.sort_by_key(|d| d.due);
        out
    }

    /// Stop scheduled and deferred triggers from dispatching. Manual
    /// triggers are unaffected.
    pub fn suspend(&self) {
        if !self.suspended.swap(true, Ordering::SeqCst) {
            warn!("Scheduled and retry triggers suspended");
        }
    }

    pub fn resume(&self) -> bool {
        let was = self.suspended.swap(false, Ordering::SeqCst);
        if was {
            info!("Scheduled and retry triggers resumed");
        }
        was
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Fire everything due at `now`. Handlers run outside the registry locks.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let mut report = TickReport::default();
        let suspended = self.is_suspended();

        let mut firings: Vec<(JobRequest, TriggerHandler)> = Vec::new();
        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            for (key, reg) in registry.iter_mut() {
                let Some(due) = reg.next_fire else { continue };
                if due > now {
                    continue;
                }
                reg.next_fire = reg.cron.next_after(&now);
                report.fired += 1;

                if suspended {
                    report.suppressed += reg.targets.len();
                    info!(trigger = %key, "Scheduling suspended; firing dropped");
                    continue;
                }
                debug!(trigger = %key, targets = reg.targets.len(), next_fire = ?reg.next_fire, "Trigger fired");
                for target in &reg.targets {
                    firings.push((JobRequest::scheduled(target), reg.handler.clone()));
                }
            }
        }

        // Deferred triggers wait out a suspension rather than being dropped.
        if !suspended {
            let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
            let (due, waiting): (Vec<Deferred>, Vec<Deferred>) =
                deferred.drain(..).partition(|d| d.due <= now);
            *deferred = waiting;
            report.deferred_fired = due.len();
            firings.extend(due.into_iter().map(|d| (d.request, d.handler)));
        }

        for (request, handler) in firings {
            let target = request.lock_key();
            match handler(request) {
                Ok(job_id) => {
                    report.dispatched += 1;
                    debug!(resource = %target, job_id = %job_id, "Dispatched");
                }
                Err(JobError::ResourceBusy(_)) => {
                    report.skipped_busy += 1;
                    debug!(resource = %target, "Resource busy; firing skipped");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(resource = %target, error = %e, "Trigger could not dispatch");
                }
            }
        }

        report
    }

    /// Tick every `period` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken, period: Duration) {
        self.running.store(true, Ordering::SeqCst);
        info!(period_ms = period.as_millis() as u64, "Scheduler started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cron;
    use crate::core::locks::{ResourceGuard, ResourceLocks};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    fn target(share: &str) -> LockKey {
        LockKey::new("nas", Some(share.to_string()))
    }

    /// Handler that acquires the lock and keeps the guard, like a job that
    /// never finishes.
    fn holding_handler(
        locks: &ResourceLocks,
        held: &Arc<Mutex<Vec<ResourceGuard>>>,
    ) -> TriggerHandler {
        let locks = locks.clone();
        let held = held.clone();
        Arc::new(move |req: JobRequest| -> Result<String, JobError> {
            let key = req.lock_key();
            let guard = locks
                .try_acquire(&key)
                .ok_or(JobError::ResourceBusy(key))?;
            held.lock().unwrap().push(guard);
            Ok("job".to_string())
        })
    }

    fn ok_handler() -> TriggerHandler {
        Arc::new(|_: JobRequest| -> Result<String, JobError> { Ok("job".to_string()) })
    }

    fn spec(key: TriggerKey, expr: &str, targets: Vec<LockKey>, handler: TriggerHandler) -> TriggerSpec {
        TriggerSpec {
            key,
            cron: cron::compile(expr).unwrap(),
            targets,
            handler,
        }
    }

    #[test]
    fn fires_when_due_and_advances() {
        let scheduler = Scheduler::new();
        let locks = ResourceLocks::new();
        let held = Arc::new(Mutex::new(Vec::new()));
        let handler = holding_handler(&locks, &held);

        scheduler.reconcile(
            vec![spec(TriggerKey::device("nas"), "0 2 * * *", vec![target("a"), target("b")], handler)],
            at(1, 0),
        );
        assert_eq!(scheduler.triggers()[0].next_fire, Some(at(2, 0)));

        assert_eq!(scheduler.tick(at(1, 59)).fired, 0);
        let report = scheduler.tick(at(2, 0));
        assert_eq!(report.fired, 1);
        assert_eq!(report.dispatched, 2);
        assert_eq!(
            scheduler.triggers()[0].next_fire,
            Some(at(2, 0) + ChronoDuration::days(1))
        );
    }

    #[test]
    fn same_key_double_fire_runs_one_job() {
        let scheduler = Scheduler::new();
        let locks = ResourceLocks::new();
        let held = Arc::new(Mutex::new(Vec::new()));
        let handler = holding_handler(&locks, &held);

        scheduler.reconcile(
            vec![
                spec(TriggerKey::device("nas"), "0 2 * * *", vec![target("docs")], handler.clone()),
                spec(TriggerKey::share("nas", "docs"), "0 2 * * *", vec![target("docs")], handler),
            ],
            at(1, 0),
        );

        let report = scheduler.tick(at(2, 0));
        assert_eq!(report.fired, 2);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.skipped_busy, 1);
        assert_eq!(held.lock().unwrap().len(), 1);
    }

    #[test]
    fn busy_target_is_skipped_not_queued() {
        let scheduler = Scheduler::new();
        let locks = ResourceLocks::new();
        let held = Arc::new(Mutex::new(Vec::new()));
        let handler = holding_handler(&locks, &held);
        let _running = locks.try_acquire(&target("docs")).unwrap();

        scheduler.reconcile(
            vec![spec(TriggerKey::device("nas"), "*/5 * * * *", vec![target("docs")], handler)],
            at(1, 0),
        );
        assert_eq!(scheduler.tick(at(1, 5)).skipped_busy, 1);
        // Nothing is pending once the lock frees; the next occurrence is the cron's.
        assert_eq!(scheduler.tick(at(1, 6)).fired, 0);
        assert!(scheduler.pending_retries().is_empty());
    }

    #[test]
    fn reconcile_keeps_next_fire_for_unchanged_triggers() {
        let scheduler = Scheduler::new();
        let handler = ok_handler();

        let report = scheduler.reconcile(
            vec![
                spec(TriggerKey::device("nas"), "0 2 * * *", vec![target("a")], handler.clone()),
                spec(TriggerKey::device("pc"), "0 3 * * *", vec![], handler.clone()),
            ],
            at(1, 0),
        );
        assert_eq!(report.added, 2);

        let report = scheduler.reconcile(
            vec![
                spec(TriggerKey::device("nas"), "0 2 * * *", vec![target("a")], handler.clone()),
                spec(TriggerKey::share("nas", "b"), "30 2 * * *", vec![target("b")], handler),
            ],
            at(1, 45),
        );
        assert_eq!(
            report,
            ReconcileReport {
                added: 1,
                updated: 0,
                unchanged: 1,
                removed: 1
            }
        );
        let triggers = scheduler.triggers();
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].next_fire, Some(at(2, 0)));
    }

    #[test]
    fn deferred_fires_once_at_due_time() {
        let scheduler = Scheduler::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let handler: TriggerHandler = Arc::new(move |_: JobRequest| -> Result<String, JobError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("job".to_string())
        });

        let mut request = JobRequest::manual("nas", Some("docs".to_string()));
        request.attempt = 1;
        scheduler.defer(at(3, 0), request, handler);
        assert_eq!(scheduler.pending_retries()[0].due, at(3, 0));

        assert_eq!(scheduler.tick(at(2, 59)).deferred_fired, 0);
        assert_eq!(scheduler.tick(at(3, 0)).deferred_fired, 1);
        assert_eq!(scheduler.tick(at(3, 1)).deferred_fired, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn suspension_drops_cron_firings_and_holds_deferred() {
        let scheduler = Scheduler::new();
        let handler = ok_handler();
        scheduler.reconcile(
            vec![spec(TriggerKey::device("nas"), "0 * * * *", vec![target("a")], handler.clone())],
            at(1, 30),
        );
        scheduler.defer(at(1, 45), JobRequest::manual("nas", None), handler);

        scheduler.suspend();
        let report = scheduler.tick(at(2, 0));
        assert_eq!(report.suppressed, 1);
        assert_eq!(report.dispatched, 0);
        assert_eq!(scheduler.pending_retries().len(), 1);

        assert!(scheduler.resume());
        let report = scheduler.tick(at(2, 1));
        assert_eq!(report.deferred_fired, 1);
        assert_eq!(report.dispatched, 1);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let scheduler = Scheduler::new();
        let shutdown = CancellationToken::new();
        let task = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown, Duration::from_millis(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(scheduler.is_running());
        assert!(scheduler.tick_count() > 0);

        shutdown.cancel();
        task.await.unwrap();
        assert!(!scheduler.is_running());
    }
}
