use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::job::JobId;
use crate::ports::TaskLauncher;

/// Identity of a task inside a job. The execution attempt is tracked on the
/// task itself and on its `RunningTaskData` entry, not in the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub job_id: JobId,
    pub name: String,
}

impl TaskId {
    pub fn new(job_id: JobId, name: impl Into<String>) -> Self {
        Self {
            job_id,
            name: name.into(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Submitted,
    Pending,
    Paused,
    Running,
    WaitingOnError,
    InError,
    Faulty,
    Finished,
}

impl TaskStatus {
    /// Terminal statuses: no further execution will ever happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Faulty)
    }

    pub fn is_alive(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::Pending => "pending",
            TaskStatus::Paused => "paused",
            TaskStatus::Running => "running",
            TaskStatus::WaitingOnError => "waiting_on_error",
            TaskStatus::InError => "in_error",
            TaskStatus::Faulty => "faulty",
            TaskStatus::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// What to do with the task and its job when a task execution ends with an
/// error. `None` and `ContinueJobExecution` both select the default
/// retry-then-continue path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OnTaskError {
    #[default]
    None,
    ContinueJobExecution,
    PauseTask,
    PauseJob,
    CancelJob,
}

/// A resource-selection script together with its bound variables.
///
/// Two scripts are interchangeable only if their *rendered* form matches:
/// bound variables are substituted, unbound references are kept verbatim, so
/// scripts that differ only in unbound references never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionScript {
    pub source: String,
    pub bindings: BTreeMap<String, String>,
}

impl SelectionScript {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            bindings: BTreeMap::new(),
        }
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    /// Script source with every bound variable substituted.
    pub fn rendered(&self) -> String {
        let mut out = self.source.clone();
        for (name, value) in &self.bindings {
            out = out.replace(&format!("${{{name}}}"), value);
        }
        out
    }
}

/// The compute resources leased from the resource manager for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLease {
    pub node_urls: Vec<String>,
}

impl ResourceLease {
    pub fn new(node_urls: Vec<String>) -> Self {
        Self { node_urls }
    }
}

/// Binding of a running task to its leased resources and remote launcher.
/// Present iff the task is running or a launcher still awaits termination.
#[derive(Clone)]
pub struct ExecuterInformation {
    pub launcher: Arc<dyn TaskLauncher>,
    pub lease: ResourceLease,
}

impl fmt::Debug for ExecuterInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuterInformation")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Per-task override of the job's on-error policy.
    pub on_task_error: Option<OnTaskError>,
    /// Remaining normal execution attempts. Decremented on every termination;
    /// never goes below -1, and -1 means the task is permanently faulty.
    pub executions_left: i32,
    /// Remaining restarts after a *node* failure, an independent budget.
    pub executions_on_failure_left: i32,
    pub max_number_of_execution: u32,
    /// Execution attempt counter, incremented each time the task starts.
    pub attempt: u32,
    pub executer_information: Option<ExecuterInformation>,
    pub selection_scripts: Vec<SelectionScript>,
    pub parallel: bool,
    pub exclusive_node_access: bool,
    /// Deferred-start timestamp (RFC 3339); a malformed value is treated as
    /// no deferral by the ordering policy.
    pub start_at: Option<String>,
    pub cleaning_script: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(job_id: JobId, name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(job_id, name),
            status: TaskStatus::Submitted,
            on_task_error: None,
            executions_left: 1,
            executions_on_failure_left: 0,
            max_number_of_execution: 1,
            attempt: 0,
            executer_information: None,
            selection_scripts: Vec::new(),
            parallel: false,
            exclusive_node_access: false,
            start_at: None,
            cleaning_script: None,
            finished_at: None,
        }
    }

    /// The on-error policy that applies to this task: its own override if
    /// set, else the job-level default.
    pub fn effective_on_error(&self, job_default: OnTaskError) -> OnTaskError {
        self.on_task_error.unwrap_or(job_default)
    }

    /// Rendered selection scripts, as the set the equivalence relation and
    /// resource searches operate on.
    pub fn rendered_scripts(&self) -> BTreeSet<String> {
        self.selection_scripts.iter().map(|s| s.rendered()).collect()
    }

    /// Clamp-decrement of the normal attempt budget; -1 is the floor.
    pub(crate) fn decrease_executions_left(&mut self) {
        self.executions_left = (self.executions_left - 1).max(-1);
    }
}

/// Outcome of one remote task execution, success or failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn value(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn had_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Immutable task snapshot sent to the listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub status: TaskStatus,
    pub executions_left: i32,
    pub attempt: u32,
}

impl TaskInfo {
    pub fn of(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            executions_left: task.executions_left,
            attempt: task.attempt,
        }
    }
}
