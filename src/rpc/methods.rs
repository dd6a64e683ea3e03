//! RPC method dispatch.
//!
//! | method            | params                         |
//! |-------------------|--------------------------------|
//! | `daemon.status`   | none                           |
//! | `jobs.list`       | `{ limit? }`                   |
//! | `jobs.get`        | `{ id }`                       |
//! | `jobs.active`     | none                           |
//! | `jobs.cancel`     | `{ id }`                       |
//! | `backups.trigger` | `{ device, share? }`           |
//! | `progress.active` | none                           |
//! | `progress.get`    | `{ id }`                       |
//! | `schedule.list`   | none                           |
//! | `schedule.reload` | none                           |
//! | `schedule.resume` | none                           |

use std::collections::HashMap;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Health;
use crate::core::orchestrator::Orchestrator;
use crate::core::progress::ProgressEvent;
use crate::core::scheduler::{DeferredInfo, TriggerInfo};

use super::protocol::{NOT_FOUND, Request, Response};

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Serialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub simulation: bool,
    pub health: Health,
}

#[derive(Debug, Serialize)]
pub struct ScheduleOverview {
    pub suspended: bool,
    pub triggers: Vec<TriggerInfo>,
    pub pending_retries: Vec<DeferredInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Triggered {
    pub job_id: String,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

pub struct MethodHandler {
    orchestrator: Orchestrator,
    start_time: Instant,
}

fn parse<T: DeserializeOwned>(id: &Value, params: Value) -> Result<T, Response> {
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}

impl MethodHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "daemon.status" => Ok(self.daemon_status(id.clone())),
            "jobs.list" => self.jobs_list(id.clone(), params).await,
            "jobs.get" => self.jobs_get(id.clone(), params).await,
            "jobs.active" => Ok(Response::success(id.clone(), self.orchestrator.active_jobs())),
            "jobs.cancel" => self.jobs_cancel(id.clone(), params),
            "backups.trigger" => self.backups_trigger(id.clone(), params).await,
            "progress.active" => Ok(self.progress_active(id.clone()).await),
            "progress.get" => self.progress_get(id.clone(), params).await,
            "schedule.list" => Ok(self.schedule_list(id.clone())),
            "schedule.reload" => Ok(self.schedule_reload(id.clone()).await),
            "schedule.resume" => Ok(Response::success(
                id.clone(),
                self.orchestrator.resume_scheduling(),
            )),
            _ => Ok(Response::method_not_found(id, &request.method)),
        };

        result.unwrap_or_else(|resp| resp)
    }

    fn daemon_status(&self, id: Value) -> Response {
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                simulation: self.orchestrator.context().config.simulation,
                health: self.orchestrator.health(),
            },
        )
    }

    async fn jobs_list(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            limit: Option<usize>,
        }

        let params: Params = if params.is_null() {
            Params::default()
        } else {
            parse(&id, params)?
        };
        let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);

        Ok(match self.orchestrator.history(limit).await {
            Ok(jobs) => Response::success(id, jobs),
            Err(e) => Response::internal_error(id, format!("{:#}", e)),
        })
    }

    async fn jobs_get(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: IdParams = parse(&id, params)?;
        Ok(match self.orchestrator.job(&params.id).await {
            Ok(Some(job)) => {
                #[derive(Serialize)]
                struct JobView {
                    #[serde(flatten)]
                    job: crate::core::BackupJob,
                    retry_summary: Option<String>,
                }
                let retry_summary = job.retry_summary();
                Response::success(id, JobView { job, retry_summary })
            }
            Ok(None) => Response::error(id, NOT_FOUND, format!("Job not found: {}", params.id)),
            Err(e) => Response::internal_error(id, format!("{:#}", e)),
        })
    }

    fn jobs_cancel(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: IdParams = parse(&id, params)?;
        Ok(if self.orchestrator.cancel(&params.id) {
            Response::success(id, true)
        } else {
            Response::error(
                id,
                NOT_FOUND,
                format!("Job not found or not active: {}", params.id),
            )
        })
    }

    async fn backups_trigger(&self, id: Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize)]
        struct Params {
            device: String,
            #[serde(default)]
            share: Option<String>,
        }

        let params: Params = parse(&id, params)?;
        Ok(
            match self
                .orchestrator
                .trigger_manual(&params.device, params.share)
                .await
            {
                Ok(job_id) => Response::success(id, Triggered { job_id }),
                Err(e) => Response::job_error(id, &e),
            },
        )
    }

    async fn progress_active(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct ActiveProgress {
            jobs: HashMap<String, ProgressEvent>,
            count: usize,
        }

        let jobs = self.orchestrator.context().progress.get_all().await;
        let count = jobs.len();
        Response::success(id, ActiveProgress { jobs, count })
    }

    async fn progress_get(&self, id: Value, params: Value) -> Result<Response, Response> {
        let params: IdParams = parse(&id, params)?;
        Ok(
            match self.orchestrator.context().progress.get(&params.id).await {
                Some(event) => Response::success(id, event),
                None => Response::error(
                    id,
                    NOT_FOUND,
                    format!("No progress for job: {}", params.id),
                ),
            },
        )
    }

    fn schedule_list(&self, id: Value) -> Response {
        Response::success(
            id,
            ScheduleOverview {
                suspended: self.orchestrator.scheduler().is_suspended(),
                triggers: self.orchestrator.triggers(),
                pending_retries: self.orchestrator.pending_retries(),
            },
        )
    }

    async fn schedule_reload(&self, id: Value) -> Response {
        match self.orchestrator.reschedule_all().await {
            Ok(report) => Response::success(id, report),
            Err(e) => Response::internal_error(id, format!("{:#}", e)),
        }
    }
}
