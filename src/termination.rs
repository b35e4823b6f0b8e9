//! Batched side effects of registry mutations.
//!
//! Registry operations run under per-job locks and must not block on the
//! resource manager or remote launchers. They record every external effect
//! (launchers to kill, leases to release, tasks to restart, jobs to finalize)
//! in a `TerminationData` batch, and the caller applies the batch once all
//! locks are released.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::{JobId, TaskId};
use crate::registry::RunningTaskData;
use crate::service::SchedulingService;

#[derive(Debug, Clone)]
pub struct TaskTerminationData {
    pub data: Arc<RunningTaskData>,
    /// Normal terminations release the lease; abnormal ones kill the remote
    /// launcher instead.
    pub normal_termination: bool,
}

#[derive(Debug, Clone)]
pub struct TaskRestartData {
    pub task_id: TaskId,
    pub delay: Duration,
}

/// Write-once accumulator of termination effects, produced by one registry
/// operation and applied exactly once afterward.
#[derive(Debug, Default)]
pub struct TerminationData {
    jobs: HashSet<JobId>,
    tasks: Vec<TaskTerminationData>,
    restarts: Vec<TaskRestartData>,
}

impl TerminationData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.tasks.is_empty() && self.restarts.is_empty()
    }

    pub fn add_job_to_terminate(&mut self, job_id: JobId) {
        self.jobs.insert(job_id);
    }

    pub fn add_task_data(&mut self, data: Arc<RunningTaskData>, normal_termination: bool) {
        self.tasks.push(TaskTerminationData {
            data,
            normal_termination,
        });
    }

    pub fn add_restart_data(&mut self, task_id: TaskId, delay: Duration) {
        self.restarts.push(TaskRestartData { task_id, delay });
    }

    pub fn job_terminated(&self, job_id: JobId) -> bool {
        self.jobs.contains(&job_id)
    }

    pub fn task_terminated(&self, task_id: &TaskId) -> bool {
        self.tasks.iter().any(|t| t.data.task_id == *task_id)
    }

    /// Apply every recorded effect. Must be called outside all registry
    /// locks; consumes the batch so it cannot be applied twice.
    pub async fn handle_termination(self, service: &Arc<SchedulingService>) {
        for entry in self.tasks {
            let data = &entry.data;
            if entry.normal_termination {
                let proxies = service.infrastructure().rm_proxies();
                match proxies.user_proxy(&data.owner, &data.credentials).await {
                    Ok(proxy) => {
                        if let Err(err) = proxy
                            .release_nodes(data.lease.clone(), data.cleaning_script.clone())
                            .await
                        {
                            warn!(task = %data.task_id, error = %err, "failed to release nodes");
                        }
                    }
                    Err(err) => {
                        warn!(
                            task = %data.task_id,
                            owner = %data.owner,
                            error = %err,
                            "no resource manager proxy, nodes not released"
                        );
                    }
                }
            } else {
                debug!(task = %data.task_id, "killing remote launcher");
                data.launcher.kill().await;
            }
        }

        for restart in self.restarts {
            let svc = Arc::clone(service);
            let task_id = restart.task_id;
            let fut = Box::pin(async move {
                svc.restart_waiting_task(task_id).await;
            });
            service.infrastructure().schedule(restart.delay, fut);
        }

        for job_id in self.jobs {
            service.job_terminated(job_id).await;
        }
    }
}
