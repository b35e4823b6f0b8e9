//! Interfaces of the external collaborators the core is built around.
//!
//! The core never talks to a database, a resource manager or a remote node
//! directly; everything goes through these traits so the surrounding layers
//! (persistence, RM client, REST front-end) stay out of the scheduling logic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Credentials, Job, JobId, JobInfo, ResourceLease, TaskInfo, TaskResult};
use crate::policy::EligibleTask;
use crate::registry::RunningTaskData;

/// Durable job/task store. The registry is authoritative for live state; the
/// store only mirrors it and owns terminal state after removal.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn new_job_submitted(&self, job: &Job);

    async fn update_job_and_tasks_state(&self, job: &Job);

    async fn job_task_started(&self, job: &Job, task_name: &str, first_task_started: bool);

    async fn update_after_task_finished(&self, job: &Job, task_name: &str, result: &TaskResult);

    /// Record one restart caused by a node failure.
    async fn task_restarted(&self, job: &Job, task_name: &str);

    async fn load_job_with_tasks_if_not_removed(&self, job_id: JobId) -> Option<Job>;

    async fn remove_job(&self, job_id: JobId, removed_at: DateTime<Utc>, remove_data: bool);
}

/// Per-owner view on the resource manager. Safe for concurrent use across
/// owners; a given task's lease is only ever released once.
#[async_trait]
pub trait RmProxy: Send + Sync {
    /// Try to book nodes matching the request; `None` when the resource
    /// manager has nothing suitable right now.
    async fn book_nodes(&self, request: &NodeRequest) -> Result<Option<ResourceLease>>;

    async fn release_nodes(
        &self,
        lease: ResourceLease,
        cleaning_script: Option<String>,
    ) -> Result<()>;
}

#[async_trait]
pub trait RmProxiesManager: Send + Sync {
    async fn user_proxy(&self, owner: &str, credentials: &Credentials) -> Result<Arc<dyn RmProxy>>;
}

/// Resource search request derived from one eligible task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    /// Rendered selection scripts (variables already bound).
    pub selection_scripts: Vec<String>,
    pub parallel: bool,
    pub exclusive_node_access: bool,
}

/// Handle on a task execution running on a remote node. The registry only
/// holds the handle; it never awaits the remote computation itself.
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    /// Forcibly terminate the remote execution. Best effort; must be safe to
    /// call on an already-dead launcher.
    async fn kill(&self);
}

/// Worker abstraction that turns a placement decision into a running remote
/// execution and hands back its launcher handle.
#[async_trait]
pub trait TaskLaunchPad: Send + Sync {
    async fn launch(
        &self,
        task: &EligibleTask,
        lease: &ResourceLease,
    ) -> Result<Arc<dyn TaskLauncher>>;
}

/// Liveness probe for running tasks, driven by the pinger loop.
#[async_trait]
pub trait NodeProber: Send + Sync {
    async fn ping(&self, task: &RunningTaskData) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    Started,
    Stopped,
    Paused,
    Frozen,
    Resumed,
    ShuttingDown,
    Killed,
    DbDown,
    JobSubmitted,
    JobPaused,
    JobResumed,
    JobInError,
    JobChangePriority,
    JobStartAtChanged,
    JobPendingToRunning,
    JobPendingToFinished,
    JobRunningToFinished,
    JobRemoveFinished,
    TaskPendingToRunning,
    TaskRunningToFinished,
    TaskWaitingForRestart,
    TaskInError,
    TaskPaused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationData<T> {
    pub event: SchedulerEvent,
    pub data: T,
}

impl<T> NotificationData<T> {
    pub fn new(event: SchedulerEvent, data: T) -> Self {
        Self { event, data }
    }
}

/// Front-end listener; the only externally observable signal of state
/// transitions. Implementations must not block.
pub trait SchedulerStateUpdate: Send + Sync {
    fn job_submitted(&self, job: &JobInfo);

    fn job_state_updated(&self, owner: &str, notification: NotificationData<JobInfo>);

    fn task_state_updated(&self, owner: &str, notification: NotificationData<TaskInfo>);

    fn scheduler_state_updated(&self, event: SchedulerEvent);
}
