//! The live job registry: authoritative in-memory state of every
//! non-terminal job and its tasks.
//!
//! All mutation goes through `LiveJobs` methods under the per-job async
//! lock. Operations that produce external side effects return a
//! [`TerminationData`](crate::termination::TerminationData) batch which the
//! caller applies after every lock is released.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::model::{
    Credentials, ExecuterInformation, Job, JobId, JobInfo, JobPriority, JobStatus, ResourceLease,
    TaskId, TaskInfo, TaskResult, TaskStatus,
};
use crate::policy::on_error::OnErrorPolicyInterpreter;
use crate::policy::{JobDescriptor, TaskDescriptor};
use crate::ports::{
    NotificationData, Persistence, SchedulerEvent, SchedulerStateUpdate, TaskLauncher,
};
use crate::termination::TerminationData;

/// Identity and resources of one running task execution. An entry lives in
/// the running set from `task_started` until the termination that consumes
/// it; probes compare entries by pointer identity, so a restarted task never
/// answers pings meant for its previous attempt.
#[derive(Clone)]
pub struct RunningTaskData {
    pub task_id: TaskId,
    pub attempt: u32,
    pub owner: String,
    pub credentials: Credentials,
    pub launcher: Arc<dyn TaskLauncher>,
    pub lease: ResourceLease,
    pub cleaning_script: Option<String>,
}

impl fmt::Debug for RunningTaskData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningTaskData")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("owner", &self.owner)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

/// A job held under its scheduling lock. Holding a `LockedJob` is the proof
/// required by `task_started`; dropping it releases the lock.
pub struct LockedJob {
    guard: OwnedMutexGuard<Job>,
}

impl LockedJob {
    pub fn job(&self) -> &Job {
        &self.guard
    }

    pub(crate) fn job_mut(&mut self) -> &mut Job {
        &mut self.guard
    }
}

/// The set of jobs locked by one scheduling pass. At most one snapshot can
/// hold a given job; everything else waits until the snapshot is dropped.
#[derive(Default)]
pub struct SchedulingSnapshot {
    jobs: HashMap<JobId, LockedJob>,
}

impl SchedulingSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn job(&self, job_id: JobId) -> Option<&LockedJob> {
        self.jobs.get(&job_id)
    }

    pub fn job_mut(&mut self, job_id: JobId) -> Option<&mut LockedJob> {
        self.jobs.get_mut(&job_id)
    }

    /// Descriptors of the locked jobs for the ordering policy: one entry per
    /// job, carrying only its placeable (PENDING) tasks.
    pub fn descriptors(&self) -> Vec<JobDescriptor> {
        self.jobs
            .values()
            .map(|locked| {
                let job = locked.job();
                JobDescriptor {
                    job_id: job.id,
                    owner: job.owner.clone(),
                    credentials: job.credentials.clone(),
                    priority: job.priority,
                    start_at: job.start_at.clone(),
                    tasks: job
                        .tasks
                        .iter()
                        .filter(|t| t.status == TaskStatus::Pending)
                        .map(|t| TaskDescriptor {
                            name: t.id.name.clone(),
                            start_at: t.start_at.clone(),
                            rendered_scripts: t.rendered_scripts(),
                            parallel: t.parallel,
                            exclusive_node_access: t.exclusive_node_access,
                        })
                        .collect(),
                }
            })
            .collect()
    }
}

/// True iff holding off is required: some priority already locked for
/// scheduling sits strictly below a priority still waiting for its lock.
/// Letting the pass proceed would then place lower-priority work while a
/// higher-priority job is busy, starving it.
pub fn priority_conflict(
    scheduled: &BTreeSet<JobPriority>,
    not_scheduled: &BTreeSet<JobPriority>,
) -> bool {
    not_scheduled
        .iter()
        .any(|p| scheduled.range(..*p).next().is_some())
}

struct JobEntry {
    job: Arc<Mutex<Job>>,
    /// Priority cached outside the job lock for the conflict check.
    priority: JobPriority,
}

pub struct LiveJobs {
    config: SchedulerConfig,
    db: Arc<dyn Persistence>,
    listener: Arc<dyn SchedulerStateUpdate>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    running: Mutex<HashMap<TaskId, Arc<RunningTaskData>>>,
}

impl LiveJobs {
    pub fn new(
        config: SchedulerConfig,
        db: Arc<dyn Persistence>,
        listener: Arc<dyn SchedulerStateUpdate>,
    ) -> Self {
        Self {
            config,
            db,
            listener,
            jobs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a newly submitted job. Attempt budgets are stamped from the
    /// task definitions and the configuration here; tasks enter PENDING.
    ///
    /// Panics on a duplicate job id or an empty task list, both of which are
    /// caller bugs rather than runtime conditions.
    pub async fn submit(&self, mut job: Job) -> JobInfo {
        if job.tasks.is_empty() {
            panic!("job {} has no tasks", job.id);
        }
        for task in &mut job.tasks {
            if task.max_number_of_execution == 0 {
                task.max_number_of_execution = self.config.max_number_of_execution;
            }
            task.executions_left = task.max_number_of_execution as i32;
            task.executions_on_failure_left = self.config.number_of_execution_on_failure as i32;
            task.status = TaskStatus::Pending;
        }
        job.status = JobStatus::Pending;

        let info = JobInfo::of(&job);
        // Persist outside the map lock: a slow store write must not stall
        // scheduling passes and queries on other jobs. The duplicate check
        // is repeated before the insert.
        if self.jobs.lock().await.contains_key(&job.id) {
            panic!("job {} already submitted", job.id);
        }
        self.db.new_job_submitted(&job).await;
        {
            let mut jobs = self.jobs.lock().await;
            if jobs.contains_key(&job.id) {
                panic!("job {} already submitted", job.id);
            }
            jobs.insert(
                job.id,
                JobEntry {
                    priority: job.priority,
                    job: Arc::new(Mutex::new(job)),
                },
            );
        }
        info!(job_id = info.id, owner = %info.owner, "job submitted");
        self.listener.job_submitted(&info);
        info
    }

    /// Acquire the per-job lock. `None` when the job is unknown or was
    /// terminated while we waited for the lock.
    async fn lock_job(&self, job_id: JobId) -> Option<LockedJob> {
        let arc = {
            let jobs = self.jobs.lock().await;
            Arc::clone(&jobs.get(&job_id)?.job)
        };
        let guard = arc.lock_owned().await;
        if self.jobs.lock().await.contains_key(&job_id) {
            Some(LockedJob { guard })
        } else {
            None
        }
    }

    /// Lock every job that has a task awaiting placement. Jobs whose lock is
    /// already held elsewhere are skipped; if skipping any of them would
    /// starve a higher priority than what we managed to lock, the whole pass
    /// backs off with an empty snapshot.
    pub async fn lock_jobs_to_schedule(&self) -> SchedulingSnapshot {
        let mut locked = HashMap::new();
        let mut scheduled = BTreeSet::new();
        let mut not_scheduled = BTreeSet::new();
        {
            let jobs = self.jobs.lock().await;
            for (id, entry) in jobs.iter() {
                match Arc::clone(&entry.job).try_lock_owned() {
                    Ok(guard) => {
                        if guard.has_runnable_task() {
                            scheduled.insert(guard.priority);
                            locked.insert(*id, LockedJob { guard });
                        }
                    }
                    // A busy job may or may not have runnable tasks; we
                    // cannot tell without its lock, so count it.
                    Err(_) => {
                        not_scheduled.insert(entry.priority);
                    }
                }
            }
        }
        if priority_conflict(&scheduled, &not_scheduled) {
            debug!(
                locked = locked.len(),
                "scheduling pass backing off, busy higher-priority job"
            );
            return SchedulingSnapshot::empty();
        }
        SchedulingSnapshot { jobs: locked }
    }

    /// Record the start of a task selected from a locked snapshot, binding
    /// it to its launcher and lease and entering it into the running set.
    pub async fn task_started(
        &self,
        locked: &mut LockedJob,
        task_name: &str,
        launcher: Arc<dyn TaskLauncher>,
        lease: ResourceLease,
    ) -> Option<Arc<RunningTaskData>> {
        let (data, task_info, first_start) = {
            let job = locked.job_mut();
            let first_start = !job.has_started();
            let owner = job.owner.clone();
            let credentials = job.credentials.clone();
            let task = job.task_mut(task_name)?;
            // Only a placeable task may start; anything else would clobber
            // the running entry and leak its lease.
            if task.status != TaskStatus::Pending {
                warn!(task = %task.id, status = %task.status, "start refused, task not pending");
                return None;
            }
            task.attempt += 1;
            task.status = TaskStatus::Running;
            task.executer_information = Some(ExecuterInformation {
                launcher: Arc::clone(&launcher),
                lease: lease.clone(),
            });
            let data = Arc::new(RunningTaskData {
                task_id: task.id.clone(),
                attempt: task.attempt,
                owner,
                credentials,
                launcher,
                lease,
                cleaning_script: task.cleaning_script.clone(),
            });
            let task_info = TaskInfo::of(task);
            if first_start {
                job.start();
            }
            job.refresh_status();
            (data, task_info, first_start)
        };

        self.running
            .lock()
            .await
            .insert(data.task_id.clone(), Arc::clone(&data));

        let job = locked.job();
        info!(task = %data.task_id, attempt = data.attempt, "task started");
        self.db.job_task_started(job, task_name, first_start).await;
        self.listener.task_state_updated(
            &job.owner,
            NotificationData::new(SchedulerEvent::TaskPendingToRunning, task_info),
        );
        if first_start {
            self.listener.job_state_updated(
                &job.owner,
                NotificationData::new(SchedulerEvent::JobPendingToRunning, JobInfo::of(job)),
            );
        }
        Some(data)
    }

    /// True iff this exact running entry is still current. A terminated or
    /// restarted task stops answering for its old entry immediately.
    pub async fn can_ping_task(&self, data: &Arc<RunningTaskData>) -> bool {
        self.running
            .lock()
            .await
            .get(&data.task_id)
            .is_some_and(|current| Arc::ptr_eq(current, data))
    }

    pub async fn running_tasks(&self) -> Vec<Arc<RunningTaskData>> {
        self.running.lock().await.values().cloned().collect()
    }

    pub async fn running_tasks_of(&self, job_id: JobId) -> Vec<Arc<RunningTaskData>> {
        self.running
            .lock()
            .await
            .values()
            .filter(|d| d.task_id.job_id == job_id)
            .cloned()
            .collect()
    }

    pub async fn has_running_tasks(&self) -> bool {
        !self.running.lock().await.is_empty()
    }

    /// Take every running entry out of the set. Used by the scheduler kill
    /// path, where every launcher is aborted and all leases are returned.
    pub(crate) async fn drain_running_tasks(&self) -> Vec<Arc<RunningTaskData>> {
        self.running.lock().await.drain().map(|(_, d)| d).collect()
    }

    pub async fn is_job_alive(&self, job_id: JobId) -> bool {
        self.jobs.lock().await.contains_key(&job_id)
    }

    pub async fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        let locked = self.lock_job(job_id).await?;
        Some(locked.job().status)
    }

    /// Cloned snapshot of a live job, for the query surface. `None` once the
    /// job has been finalized.
    pub async fn job_snapshot(&self, job_id: JobId) -> Option<Job> {
        let locked = self.lock_job(job_id).await?;
        Some(locked.job().clone())
    }

    pub async fn pause_job(&self, job_id: JobId) -> bool {
        let Some(mut locked) = self.lock_job(job_id).await else {
            return false;
        };
        if locked.job().status == JobStatus::Paused || locked.job().status.is_terminal() {
            return false;
        }
        let (owner, changed) = {
            let job = locked.job_mut();
            (job.owner.clone(), job.set_paused())
        };
        let job = locked.job();
        self.db.update_job_and_tasks_state(job).await;
        info!(job_id, "job paused");
        self.notify_tasks(job, &owner, &changed, SchedulerEvent::TaskPaused);
        self.listener.job_state_updated(
            &owner,
            NotificationData::new(SchedulerEvent::JobPaused, JobInfo::of(job)),
        );
        true
    }

    pub async fn resume_job(&self, job_id: JobId) -> bool {
        let Some(mut locked) = self.lock_job(job_id).await else {
            return false;
        };
        if locked.job().status != JobStatus::Paused {
            return false;
        }
        let (owner, changed) = {
            let job = locked.job_mut();
            (job.owner.clone(), job.set_unpause())
        };
        let job = locked.job();
        self.db.update_job_and_tasks_state(job).await;
        info!(job_id, status = %job.status, "job resumed");
        self.notify_tasks(job, &owner, &changed, SchedulerEvent::JobResumed);
        self.listener.job_state_updated(
            &owner,
            NotificationData::new(SchedulerEvent::JobResumed, JobInfo::of(job)),
        );
        true
    }

    /// Rewrite the job-level deferred-start timestamp. The value is applied
    /// by the ordering policy on the next pass.
    pub async fn update_start_at(&self, job_id: JobId, start_at: Option<String>) -> bool {
        let Some(mut locked) = self.lock_job(job_id).await else {
            return false;
        };
        let owner = {
            let job = locked.job_mut();
            job.start_at = start_at;
            job.owner.clone()
        };
        let job = locked.job();
        self.db.update_job_and_tasks_state(job).await;
        debug!(job_id, start_at = ?job.start_at, "job start-at updated");
        self.listener.job_state_updated(
            &owner,
            NotificationData::new(SchedulerEvent::JobStartAtChanged, JobInfo::of(job)),
        );
        true
    }

    pub async fn change_job_priority(&self, job_id: JobId, priority: JobPriority) -> bool {
        let Some(mut locked) = self.lock_job(job_id).await else {
            return false;
        };
        let owner = {
            let job = locked.job_mut();
            job.priority = priority;
            job.owner.clone()
        };
        if let Some(entry) = self.jobs.lock().await.get_mut(&job_id) {
            entry.priority = priority;
        }
        let job = locked.job();
        self.db.update_job_and_tasks_state(job).await;
        info!(job_id, priority = ?priority, "job priority changed");
        self.listener.job_state_updated(
            &owner,
            NotificationData::new(SchedulerEvent::JobChangePriority, JobInfo::of(job)),
        );
        true
    }

    /// Return a WAITING_ON_ERROR task to PENDING once its restart delay has
    /// elapsed, making it placeable again.
    pub async fn restart_waiting_task(&self, task_id: &TaskId) -> bool {
        let Some(mut locked) = self.lock_job(task_id.job_id).await else {
            return false;
        };
        {
            let job = locked.job_mut();
            let Some(task) = job.task_mut(&task_id.name) else {
                return false;
            };
            if task.status != TaskStatus::WaitingOnError {
                return false;
            }
            task.status = TaskStatus::Pending;
            job.refresh_status();
        }
        let job = locked.job();
        self.db.update_job_and_tasks_state(job).await;
        debug!(task = %task_id, "task requeued after error");
        true
    }

    /// Manually requeue a task suspended IN_ERROR, giving it another run
    /// with whatever attempt budget it has left.
    pub async fn restart_in_error_task(&self, task_id: &TaskId) -> bool {
        let Some(mut locked) = self.lock_job(task_id.job_id).await else {
            return false;
        };
        let (owner, task_info) = {
            let job = locked.job_mut();
            let owner = job.owner.clone();
            let Some(task) = job.task_mut(&task_id.name) else {
                return false;
            };
            if task.status != TaskStatus::InError {
                return false;
            }
            task.status = TaskStatus::Pending;
            let task_info = TaskInfo::of(task);
            job.refresh_status();
            (owner, task_info)
        };
        let job = locked.job();
        self.db.update_job_and_tasks_state(job).await;
        info!(task = %task_id, "in-error task requeued");
        self.listener.task_state_updated(
            &owner,
            NotificationData::new(SchedulerEvent::TaskWaitingForRestart, task_info),
        );
        true
    }

    /// Core success/failure state machine, run when a remote execution ends.
    pub async fn task_terminated_with_result(
        &self,
        task_id: &TaskId,
        result: TaskResult,
    ) -> TerminationData {
        let mut batch = TerminationData::new();
        let Some(mut locked) = self.lock_job(task_id.job_id).await else {
            warn!(task = %task_id, "termination for unknown job ignored");
            return batch;
        };
        let running_entry = self.running.lock().await.remove(task_id);

        enum JobAction {
            None,
            Completed,
            Cancel,
            PauseJob,
        }

        let (owner, task_info, task_event, action, normal_termination) = {
            let job = locked.job_mut();
            let owner = job.owner.clone();
            let job_default = job.on_task_error;
            let Some(task) = job.task_mut(&task_id.name) else {
                warn!(task = %task_id, "termination for unknown task ignored");
                return batch;
            };
            if running_entry.is_none() && task.status != TaskStatus::Running {
                warn!(task = %task_id, status = %task.status, "stale termination ignored");
                return batch;
            }

            task.decrease_executions_left();
            task.executer_information = None;
            let mut normal_termination = true;
            let mut action = JobAction::None;
            if !result.had_error() {
                task.status = TaskStatus::Finished;
                task.finished_at = Some(Utc::now());
                info!(task = %task_id, "task finished");
            } else {
                let policy = task.effective_on_error(job_default);
                let interpreter = OnErrorPolicyInterpreter;
                if interpreter.requires_cancel_job_on_error(policy) {
                    task.status = TaskStatus::Faulty;
                    task.finished_at = Some(Utc::now());
                    normal_termination = false;
                    action = JobAction::Cancel;
                } else if interpreter.requires_pause_job_on_error(policy) {
                    task.status = TaskStatus::InError;
                    action = JobAction::PauseJob;
                } else if interpreter.requires_pause_task_on_error(policy) {
                    if task.executions_left == -1 {
                        task.status = TaskStatus::Faulty;
                        task.finished_at = Some(Utc::now());
                    } else {
                        task.status = TaskStatus::InError;
                    }
                } else if task.executions_left > 0 {
                    task.status = TaskStatus::WaitingOnError;
                    batch.add_restart_data(task_id.clone(), self.config.restart_on_error_delay);
                } else {
                    task.status = TaskStatus::Faulty;
                    task.finished_at = Some(Utc::now());
                }
                info!(
                    task = %task_id,
                    status = %task.status,
                    executions_left = task.executions_left,
                    "task terminated with error"
                );
            }
            let task_info = TaskInfo::of(task);
            let task_event = match task.status {
                TaskStatus::InError => SchedulerEvent::TaskInError,
                TaskStatus::WaitingOnError => SchedulerEvent::TaskWaitingForRestart,
                _ => SchedulerEvent::TaskRunningToFinished,
            };

            if matches!(action, JobAction::None) {
                job.refresh_status();
                if job.is_finished() {
                    action = JobAction::Completed;
                }
            }
            (owner, task_info, task_event, action, normal_termination)
        };

        if let Some(data) = running_entry {
            batch.add_task_data(data, normal_termination);
        }

        self.listener
            .task_state_updated(&owner, NotificationData::new(task_event, task_info));

        match action {
            JobAction::Cancel => {
                self.end_job(&mut locked, &mut batch, JobStatus::Canceled)
                    .await;
            }
            JobAction::Completed => {
                self.end_job(&mut locked, &mut batch, JobStatus::Finished)
                    .await;
            }
            JobAction::PauseJob => {
                let changed = locked.job_mut().set_paused();
                let job = locked.job();
                self.db.update_job_and_tasks_state(job).await;
                info!(job_id = job.id, "job paused after task error");
                self.notify_tasks(job, &owner, &changed, SchedulerEvent::TaskPaused);
                self.listener.job_state_updated(
                    &owner,
                    NotificationData::new(SchedulerEvent::JobPaused, JobInfo::of(job)),
                );
            }
            JobAction::None => {
                let job = locked.job();
                self.db
                    .update_after_task_finished(job, &task_id.name, &result)
                    .await;
                if job.status == JobStatus::InError {
                    self.listener.job_state_updated(
                        &owner,
                        NotificationData::new(SchedulerEvent::JobInError, JobInfo::of(job)),
                    );
                }
            }
        }
        batch
    }

    /// React to a failed liveness probe. With budget remaining the task goes
    /// back to PENDING and the restart is recorded in persistence; once the
    /// budget is spent the task terminates FAULTY. A task paused while its
    /// node died is parked PAUSED instead, and resuming the job requeues it.
    ///
    /// Panics if the task was never started: a node cannot fail under a
    /// task that never ran on one. Reports for an attempt that already
    /// ended are stale and ignored.
    pub async fn restart_task_on_node_failure(
        &self,
        data: &Arc<RunningTaskData>,
    ) -> TerminationData {
        let mut batch = TerminationData::new();
        let task_id = data.task_id.clone();
        let Some(mut locked) = self.lock_job(task_id.job_id).await else {
            return batch;
        };
        match locked.job().task(&task_id.name) {
            None => return batch,
            Some(task) => {
                if task.attempt == 0 {
                    panic!("node failure reported for task {task_id} that was never started");
                }
                // Stale report: the attempt already ended or was requeued.
                // PAUSED is still live here: pausing a job keeps the remote
                // execution and its running entry.
                if !matches!(task.status, TaskStatus::Running | TaskStatus::Paused) {
                    return batch;
                }
            }
        }
        let entry = {
            let mut running = self.running.lock().await;
            match running.get(&task_id) {
                Some(current) if Arc::ptr_eq(current, data) => running.remove(&task_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            warn!(task = %task_id, "node failure raced with termination, ignored");
            return batch;
        };

        let (owner, restarted, failures_left, task_info) = {
            let job = locked.job_mut();
            let owner = job.owner.clone();
            // Present and live, checked above.
            let Some(task) = job.task_mut(&task_id.name) else {
                return batch;
            };
            let was_paused = task.status == TaskStatus::Paused;
            task.executions_on_failure_left -= 1;
            task.executer_information = None;
            let failures_left = task.executions_on_failure_left;
            let restarted = failures_left > 0;
            if !restarted {
                task.status = TaskStatus::Faulty;
                task.finished_at = Some(Utc::now());
            } else if was_paused {
                // Parked: set_unpause turns it into PENDING on resume now
                // that the launcher handle is gone.
                task.status = TaskStatus::Paused;
            } else {
                task.status = TaskStatus::Pending;
            }
            let task_info = TaskInfo::of(task);
            job.refresh_status();
            (owner, restarted, failures_left, task_info)
        };

        // The node is gone; kill the launcher rather than releasing nodes.
        batch.add_task_data(entry, false);

        if restarted {
            let job = locked.job();
            warn!(task = %task_id, failures_left, "node failure, task requeued");
            self.db.task_restarted(job, &task_id.name).await;
            self.listener.task_state_updated(
                &owner,
                NotificationData::new(SchedulerEvent::TaskWaitingForRestart, task_info),
            );
        } else {
            warn!(task = %task_id, "node failure, restart budget spent");
            self.listener.task_state_updated(
                &owner,
                NotificationData::new(SchedulerEvent::TaskRunningToFinished, task_info),
            );
            if locked.job().is_finished() {
                self.end_job(&mut locked, &mut batch, JobStatus::Finished)
                    .await;
            } else {
                let job = locked.job();
                self.db.update_job_and_tasks_state(job).await;
            }
        }
        batch
    }

    /// Kill one job: every running task is aborted and the job ends KILLED.
    pub async fn kill_job(&self, job_id: JobId) -> TerminationData {
        let mut batch = TerminationData::new();
        let Some(mut locked) = self.lock_job(job_id).await else {
            return batch;
        };
        info!(job_id, "killing job");
        self.end_job(&mut locked, &mut batch, JobStatus::Killed).await;
        batch
    }

    /// Kill one task. The task terminates FAULTY; if its effective on-error
    /// policy cancels the job, the whole job goes down with it.
    pub async fn kill_task(&self, task_id: &TaskId) -> Result<TerminationData> {
        let mut batch = TerminationData::new();
        let Some(mut locked) = self.lock_job(task_id.job_id).await else {
            return Err(SchedulerError::UnknownJob(task_id.job_id));
        };
        let (owner, cancel_job, task_info) = {
            let job = locked.job_mut();
            let owner = job.owner.clone();
            let job_default = job.on_task_error;
            let Some(task) = job.task_mut(&task_id.name) else {
                return Err(SchedulerError::UnknownTask(task_id.to_string()));
            };
            if task.status.is_terminal() {
                return Ok(batch);
            }
            let cancel_job = OnErrorPolicyInterpreter
                .requires_cancel_job_on_error(task.effective_on_error(job_default));
            task.status = TaskStatus::Faulty;
            task.finished_at = Some(Utc::now());
            task.executer_information = None;
            (owner, cancel_job, TaskInfo::of(task))
        };
        if let Some(entry) = self.running.lock().await.remove(task_id) {
            batch.add_task_data(entry, false);
        }
        info!(task = %task_id, "task killed");
        self.listener.task_state_updated(
            &owner,
            NotificationData::new(SchedulerEvent::TaskRunningToFinished, task_info),
        );
        if cancel_job {
            self.end_job(&mut locked, &mut batch, JobStatus::Canceled)
                .await;
        } else if locked.job().is_finished() {
            self.end_job(&mut locked, &mut batch, JobStatus::Finished)
                .await;
        } else {
            locked.job_mut().refresh_status();
            let job = locked.job();
            self.db.update_job_and_tasks_state(job).await;
        }
        Ok(batch)
    }

    /// Finalize a job: drop it from the registry, abort its remaining
    /// running tasks through the batch and notify. For CANCELED/KILLED the
    /// still-alive tasks are marked FAULTY; for FINISHED they are already
    /// terminal.
    async fn end_job(
        &self,
        locked: &mut LockedJob,
        batch: &mut TerminationData,
        status: JobStatus,
    ) {
        let job_id = locked.job().id;
        self.jobs.lock().await.remove(&job_id);
        {
            let mut running = self.running.lock().await;
            let ids: Vec<TaskId> = running
                .keys()
                .filter(|id| id.job_id == job_id)
                .cloned()
                .collect();
            for id in ids {
                if let Some(entry) = running.remove(&id) {
                    batch.add_task_data(entry, false);
                }
            }
        }
        let (owner, event) = {
            let job = locked.job_mut();
            if status.is_terminal() && status != JobStatus::Finished {
                for task in &mut job.tasks {
                    if task.status.is_alive() {
                        task.status = TaskStatus::Faulty;
                        task.finished_at = Some(Utc::now());
                    }
                    task.executer_information = None;
                }
            }
            job.status = status;
            job.finished_at = Some(Utc::now());
            let event = if job.has_started() {
                SchedulerEvent::JobRunningToFinished
            } else {
                SchedulerEvent::JobPendingToFinished
            };
            (job.owner.clone(), event)
        };
        let job = locked.job();
        self.db.update_job_and_tasks_state(job).await;
        info!(job_id, status = %status, "job terminated");
        self.listener
            .job_state_updated(&owner, NotificationData::new(event, JobInfo::of(job)));
        batch.add_job_to_terminate(job_id);
    }

    fn notify_tasks(&self, job: &Job, owner: &str, ids: &[TaskId], event: SchedulerEvent) {
        for id in ids {
            if let Some(task) = job.task(&id.name) {
                self.listener
                    .task_state_updated(owner, NotificationData::new(event, TaskInfo::of(task)));
            }
        }
    }
}
