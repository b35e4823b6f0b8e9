use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::task::{OnTaskError, Task, TaskId, TaskStatus};

pub type JobId = u64;

/// Ordered job priorities; a higher variant always outranks a lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Highest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Stalled,
    Paused,
    InError,
    Canceled,
    Finished,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::Finished | JobStatus::Killed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Stalled => "stalled",
            JobStatus::Paused => "paused",
            JobStatus::InError => "in_error",
            JobStatus::Canceled => "canceled",
            JobStatus::Finished => "finished",
            JobStatus::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

/// Opaque credentials of the submitting user, forwarded to the resource
/// manager when acquiring and releasing nodes on the user's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials(pub String);

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub owner: String,
    pub credentials: Credentials,
    pub priority: JobPriority,
    /// Default on-error policy for tasks without their own override.
    pub on_task_error: OnTaskError,
    /// Kept consistent with `derived_status()` by the registry; pause and
    /// cancel/kill are the only statuses carried independently of the tasks.
    pub status: JobStatus,
    /// Deferred-start timestamp (RFC 3339), job-level.
    pub start_at: Option<String>,
    pub tasks: Vec<Task>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        owner: impl Into<String>,
        priority: JobPriority,
        on_task_error: OnTaskError,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            owner: owner.into(),
            credentials: Credentials(String::new()),
            priority,
            on_task_error,
            status: JobStatus::Pending,
            start_at: None,
            tasks: Vec::new(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id.name == name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id.name == name)
    }

    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// All tasks reached a terminal status, nothing left to run.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Record the start of the first task.
    pub(crate) fn start(&mut self) {
        self.started_at = Some(Utc::now());
    }

    /// Job status implied by the current task set, ignoring an explicit
    /// pause/cancel/kill. In-error outranks running: a job with a suspended
    /// faulty task is in error even while siblings keep executing.
    fn status_from_tasks(&self) -> JobStatus {
        if !self.has_started() {
            return JobStatus::Pending;
        }
        if self.is_finished() {
            return JobStatus::Finished;
        }
        if self.tasks.iter().any(|t| t.status == TaskStatus::InError) {
            return JobStatus::InError;
        }
        if self.tasks.iter().any(|t| t.status == TaskStatus::Running) {
            return JobStatus::Running;
        }
        JobStatus::Stalled
    }

    /// Pure derivation of the job status from its tasks plus the explicit
    /// pause/cancel actions. The registry keeps `status` equal to this.
    pub fn derived_status(&self) -> JobStatus {
        match self.status {
            JobStatus::Paused | JobStatus::Canceled | JobStatus::Killed => self.status,
            _ => self.status_from_tasks(),
        }
    }

    pub(crate) fn refresh_status(&mut self) {
        self.status = self.derived_status();
    }

    /// Pause the job: every non-terminal, non-suspended task becomes PAUSED
    /// (running tasks included; their remote execution keeps its resources
    /// until it terminates). Returns the ids of the tasks that changed.
    pub(crate) fn set_paused(&mut self) -> Vec<TaskId> {
        let mut changed = Vec::new();
        for task in &mut self.tasks {
            if matches!(
                task.status,
                TaskStatus::Submitted
                    | TaskStatus::Pending
                    | TaskStatus::WaitingOnError
                    | TaskStatus::Running
            ) {
                task.status = TaskStatus::Paused;
                changed.push(task.id.clone());
            }
        }
        self.status = JobStatus::Paused;
        changed
    }

    /// Undo a pause: paused tasks with a live launcher go back to RUNNING,
    /// the rest become PENDING; the job status falls back to the one implied
    /// by its task set. Returns the ids of the tasks that changed.
    pub(crate) fn set_unpause(&mut self) -> Vec<TaskId> {
        let mut changed = Vec::new();
        for task in &mut self.tasks {
            if task.status == TaskStatus::Paused {
                task.status = if task.executer_information.is_some() {
                    TaskStatus::Running
                } else {
                    TaskStatus::Pending
                };
                changed.push(task.id.clone());
            }
        }
        self.status = self.status_from_tasks();
        changed
    }

    /// A job is schedulable when it is not paused/terminal and at least one
    /// task awaits placement.
    pub(crate) fn has_runnable_task(&self) -> bool {
        !matches!(
            self.status,
            JobStatus::Paused | JobStatus::Canceled | JobStatus::Finished | JobStatus::Killed
        ) && self.tasks.iter().any(|t| t.status == TaskStatus::Pending)
    }
}

/// Immutable job snapshot sent to the listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub owner: String,
    pub status: JobStatus,
    pub priority: JobPriority,
}

impl JobInfo {
    pub fn of(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            owner: job.owner.clone(),
            status: job.status,
            priority: job.priority,
        }
    }
}
