//! The top-level scheduler state machine and its periodic drivers.

pub mod job_remove;

pub use job_remove::JobRemoveHandler;

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::infra::{BoxFuture, Infrastructure};
use crate::model::{Job, JobId, JobInfo, JobPriority, TaskId, TaskResult};
use crate::policy::{tasks_equivalent, EligibleTask, Policy};
use crate::ports::{NodeProber, NodeRequest, SchedulerEvent, SchedulerStateUpdate, TaskLaunchPad};
use crate::registry::{LiveJobs, RunningTaskData};

/// Lifecycle state of the scheduler process itself; gates submission and
/// placement, not the individual jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerStatus {
    Started,
    Stopped,
    Paused,
    Frozen,
    ShuttingDown,
    Killed,
    DbDown,
    Unlinked,
}

impl SchedulerStatus {
    pub fn is_submit_possible(self) -> bool {
        !matches!(
            self,
            SchedulerStatus::Killed
                | SchedulerStatus::Stopped
                | SchedulerStatus::ShuttingDown
                | SchedulerStatus::DbDown
        )
    }

    /// States from which no further transition makes sense.
    pub fn is_down(self) -> bool {
        matches!(self, SchedulerStatus::Killed | SchedulerStatus::DbDown)
    }
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulerStatus::Started => "started",
            SchedulerStatus::Stopped => "stopped",
            SchedulerStatus::Paused => "paused",
            SchedulerStatus::Frozen => "frozen",
            SchedulerStatus::ShuttingDown => "shutting_down",
            SchedulerStatus::Killed => "killed",
            SchedulerStatus::DbDown => "db_down",
            SchedulerStatus::Unlinked => "unlinked",
        };
        write!(f, "{s}")
    }
}

/// Owns the registry, the ordering policy and the infrastructure, and drives
/// scheduling passes while its own state machine allows them.
pub struct SchedulingService {
    config: SchedulerConfig,
    status: Mutex<SchedulerStatus>,
    jobs: Arc<LiveJobs>,
    policy: Arc<dyn Policy>,
    launch_pad: Arc<dyn TaskLaunchPad>,
    infrastructure: Arc<dyn Infrastructure>,
    listener: Arc<dyn SchedulerStateUpdate>,
}

impl SchedulingService {
    /// Constructed STOPPED; `start()` brings it up explicitly.
    pub fn new(
        config: SchedulerConfig,
        infrastructure: Arc<dyn Infrastructure>,
        listener: Arc<dyn SchedulerStateUpdate>,
        policy: Arc<dyn Policy>,
        launch_pad: Arc<dyn TaskLaunchPad>,
    ) -> Arc<Self> {
        let jobs = Arc::new(LiveJobs::new(
            config.clone(),
            Arc::clone(infrastructure.db()),
            Arc::clone(&listener),
        ));
        Arc::new(Self {
            config,
            status: Mutex::new(SchedulerStatus::Stopped),
            jobs,
            policy,
            launch_pad,
            infrastructure,
            listener,
        })
    }

    pub fn jobs(&self) -> &Arc<LiveJobs> {
        &self.jobs
    }

    pub fn infrastructure(&self) -> &Arc<dyn Infrastructure> {
        &self.infrastructure
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn listener(&self) -> &Arc<dyn SchedulerStateUpdate> {
        &self.listener
    }

    pub async fn status(&self) -> SchedulerStatus {
        *self.status.lock().await
    }

    pub async fn is_submit_possible(&self) -> bool {
        self.status.lock().await.is_submit_possible()
    }

    async fn switch(&self, from: &[SchedulerStatus], to: SchedulerStatus, event: SchedulerEvent) -> bool {
        let mut status = self.status.lock().await;
        if !from.contains(&*status) {
            return false;
        }
        info!(from = %*status, to = %to, "scheduler status change");
        *status = to;
        drop(status);
        self.listener.scheduler_state_updated(event);
        true
    }

    pub async fn start(&self) -> bool {
        self.switch(
            &[SchedulerStatus::Stopped],
            SchedulerStatus::Started,
            SchedulerEvent::Started,
        )
        .await
    }

    pub async fn pause(&self) -> bool {
        self.switch(
            &[SchedulerStatus::Started, SchedulerStatus::Frozen],
            SchedulerStatus::Paused,
            SchedulerEvent::Paused,
        )
        .await
    }

    pub async fn freeze(&self) -> bool {
        self.switch(
            &[SchedulerStatus::Started, SchedulerStatus::Paused],
            SchedulerStatus::Frozen,
            SchedulerEvent::Frozen,
        )
        .await
    }

    pub async fn resume(&self) -> bool {
        self.switch(
            &[SchedulerStatus::Frozen, SchedulerStatus::Paused],
            SchedulerStatus::Started,
            SchedulerEvent::Resumed,
        )
        .await
    }

    pub async fn stop(&self) -> bool {
        self.switch(
            &[
                SchedulerStatus::Started,
                SchedulerStatus::Paused,
                SchedulerStatus::Frozen,
            ],
            SchedulerStatus::Stopped,
            SchedulerEvent::Stopped,
        )
        .await
    }

    /// Halt submissions after losing the database; running tasks are left
    /// alone.
    pub async fn database_down(&self) -> bool {
        let mut status = self.status.lock().await;
        if *status == SchedulerStatus::DbDown {
            return false;
        }
        warn!("database down, halting submissions");
        *status = SchedulerStatus::DbDown;
        drop(status);
        self.listener
            .scheduler_state_updated(SchedulerEvent::DbDown);
        true
    }

    /// Begin a graceful shutdown: no new placement, running tasks drain, and
    /// a delayed finalization kills the scheduler once nothing runs anymore.
    pub async fn shutdown(self: &Arc<Self>) -> bool {
        let moved = self
            .switch(
                &[
                    SchedulerStatus::Started,
                    SchedulerStatus::Paused,
                    SchedulerStatus::Frozen,
                    SchedulerStatus::Stopped,
                ],
                SchedulerStatus::ShuttingDown,
                SchedulerEvent::ShuttingDown,
            )
            .await;
        if moved {
            self.schedule_shutdown_finalization();
        }
        moved
    }

    fn schedule_shutdown_finalization(self: &Arc<Self>) {
        let service = Arc::clone(self);
        self.infrastructure.schedule(
            self.config.shutdown_poll_delay,
            Box::pin(async move {
                if service.status().await != SchedulerStatus::ShuttingDown {
                    return;
                }
                if service.jobs.has_running_tasks().await {
                    service.schedule_shutdown_finalization();
                } else {
                    service.kill().await;
                }
            }),
        );
    }

    /// The one fully destructive transition: abort every running launcher,
    /// give all leases back and stop the infrastructure. Repeating it is a
    /// no-op returning false.
    pub async fn kill(self: &Arc<Self>) -> bool {
        {
            let mut status = self.status.lock().await;
            if status.is_down() {
                return false;
            }
            *status = SchedulerStatus::Killed;
        }
        info!("killing scheduler");
        for data in self.jobs.drain_running_tasks().await {
            data.launcher.kill().await;
            match self
                .infrastructure
                .rm_proxies()
                .user_proxy(&data.owner, &data.credentials)
                .await
            {
                Ok(proxy) => {
                    if let Err(err) = proxy
                        .release_nodes(data.lease.clone(), data.cleaning_script.clone())
                        .await
                    {
                        warn!(task = %data.task_id, error = %err, "failed to release nodes on kill");
                    }
                }
                Err(err) => {
                    warn!(owner = %data.owner, error = %err, "no resource manager proxy on kill");
                }
            }
        }
        self.infrastructure.shutdown();
        self.listener.scheduler_state_updated(SchedulerEvent::Killed);
        true
    }

    /// Submit one job; refused with an error value while the state machine
    /// does not accept submissions.
    pub async fn submit_job(&self, job: Job) -> Result<JobInfo> {
        let status = self.status().await;
        if !status.is_submit_possible() {
            return Err(SchedulerError::SubmissionRefused(status));
        }
        Ok(self.jobs.submit(job).await)
    }

    pub async fn pause_job(&self, job_id: JobId) -> bool {
        self.jobs.pause_job(job_id).await
    }

    pub async fn resume_job(&self, job_id: JobId) -> bool {
        self.jobs.resume_job(job_id).await
    }

    pub async fn change_job_priority(&self, job_id: JobId, priority: JobPriority) -> bool {
        self.jobs.change_job_priority(job_id, priority).await
    }

    pub async fn update_job_start_at(&self, job_id: JobId, start_at: Option<String>) -> bool {
        self.jobs.update_start_at(job_id, start_at).await
    }

    pub async fn kill_job(self: &Arc<Self>, job_id: JobId) -> bool {
        let batch = self.jobs.kill_job(job_id).await;
        let killed = batch.job_terminated(job_id);
        batch.handle_termination(self).await;
        killed
    }

    pub async fn kill_task(self: &Arc<Self>, task_id: &TaskId) -> Result<()> {
        let batch = self.jobs.kill_task(task_id).await?;
        batch.handle_termination(self).await;
        Ok(())
    }

    /// Entry point for task completions reported by the worker layer.
    pub async fn task_terminated_with_result(
        self: &Arc<Self>,
        task_id: &TaskId,
        result: TaskResult,
    ) {
        let batch = self.jobs.task_terminated_with_result(task_id, result).await;
        batch.handle_termination(self).await;
    }

    /// Dispatch a node-failure restart to the internal pool. Dropped, not
    /// queued, once the scheduler is killed.
    pub async fn restart_task_on_node_failure(self: &Arc<Self>, data: Arc<RunningTaskData>) {
        if self.status().await.is_down() {
            debug!(task = %data.task_id, "scheduler down, dropping node-failure restart");
            return;
        }
        let service = Arc::clone(self);
        self.infrastructure.spawn_internal(Box::pin(async move {
            let batch = service.jobs.restart_task_on_node_failure(&data).await;
            batch.handle_termination(&service).await;
        }));
    }

    pub(crate) async fn restart_waiting_task(&self, task_id: TaskId) -> bool {
        self.jobs.restart_waiting_task(&task_id).await
    }

    pub async fn restart_in_error_task(&self, task_id: &TaskId) -> bool {
        self.jobs.restart_in_error_task(task_id).await
    }

    /// Finalization hook applied by the termination batch. With the
    /// housekeeping delay configured, the job is scheduled for removal.
    ///
    /// Not an `async fn`: the removal handler calls back into this hook
    /// through the termination batch, and the erased `BoxFuture` return is
    /// what keeps that recursive future provably `Send`.
    pub fn job_terminated(self: &Arc<Self>, job_id: JobId) -> BoxFuture {
        let service = Arc::clone(self);
        Box::pin(async move {
            debug!(job_id, "job finalized");
            if let Some(delay) = service.config.auto_remove_job_delay {
                let handler = JobRemoveHandler::new(Arc::clone(&service), job_id);
                service.infrastructure.schedule(
                    delay,
                    Box::pin(async move {
                        handler.call().await;
                    }),
                );
            }
        })
    }

    /// One scheduling pass: lock a snapshot, order eligible tasks, book
    /// nodes and launch. Returns the number of tasks started. When a
    /// resource search comes back empty, every later equivalent task is
    /// skipped without a new search.
    pub async fn schedule_once(self: &Arc<Self>) -> usize {
        if self.status().await != SchedulerStatus::Started {
            return 0;
        }
        let mut snapshot = self.jobs.lock_jobs_to_schedule().await;
        if snapshot.is_empty() {
            return 0;
        }
        let descriptors = snapshot.descriptors();
        let ordered = self.policy.ordered_tasks(&descriptors, Utc::now());
        debug!(jobs = snapshot.len(), tasks = ordered.len(), "scheduling pass");

        let mut started = 0;
        let mut unsatisfied: Vec<EligibleTask> = Vec::new();
        for task in ordered {
            if unsatisfied.iter().any(|u| tasks_equivalent(u, &task)) {
                debug!(job_id = task.job_id, task = %task.task_name, "skipped, equivalent search already failed");
                continue;
            }
            let proxy = match self
                .infrastructure
                .rm_proxies()
                .user_proxy(&task.owner, &task.credentials)
                .await
            {
                Ok(proxy) => proxy,
                Err(err) => {
                    warn!(owner = %task.owner, error = %err, "no resource manager proxy");
                    continue;
                }
            };
            let request = NodeRequest {
                selection_scripts: task.rendered_scripts.iter().cloned().collect(),
                parallel: task.parallel,
                exclusive_node_access: task.exclusive_node_access,
            };
            let lease = match proxy.book_nodes(&request).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    unsatisfied.push(task);
                    continue;
                }
                Err(err) => {
                    warn!(job_id = task.job_id, task = %task.task_name, error = %err, "resource search failed");
                    unsatisfied.push(task);
                    continue;
                }
            };
            let launcher = match self.launch_pad.launch(&task, &lease).await {
                Ok(launcher) => launcher,
                Err(err) => {
                    warn!(job_id = task.job_id, task = %task.task_name, error = %err, "task launch failed");
                    if let Err(err) = proxy.release_nodes(lease, None).await {
                        warn!(error = %err, "failed to release nodes after launch failure");
                    }
                    continue;
                }
            };
            if let Some(locked) = snapshot.job_mut(task.job_id) {
                if self
                    .jobs
                    .task_started(locked, &task.task_name, launcher, lease)
                    .await
                    .is_some()
                {
                    started += 1;
                }
            }
        }
        started
    }

    /// Periodic driver of scheduling passes, gated by the token.
    pub async fn run_scheduling_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.scheduling_interval);
        info!("scheduling loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("scheduling loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    let started = self.schedule_once().await;
                    if started > 0 {
                        debug!(started, "scheduling pass placed tasks");
                    }
                }
            }
        }
    }

    /// Periodic liveness probing of running tasks; a failed probe triggers
    /// the node-failure restart path.
    pub async fn run_pinger_loop(
        self: Arc<Self>,
        prober: Arc<dyn NodeProber>,
        token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        info!("pinger loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("pinger loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    for data in self.jobs.running_tasks().await {
                        if !self.jobs.can_ping_task(&data).await {
                            continue;
                        }
                        if !prober.ping(&data).await {
                            warn!(task = %data.task_id, "liveness probe failed");
                            self.restart_task_on_node_failure(data).await;
                        }
                    }
                }
            }
        }
    }
}
