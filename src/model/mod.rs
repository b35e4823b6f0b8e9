pub mod job;
pub mod task;

pub use job::{Credentials, Job, JobId, JobInfo, JobPriority, JobStatus};
pub use task::{
    ExecuterInformation, OnTaskError, ResourceLease, SelectionScript, Task, TaskId, TaskInfo,
    TaskResult, TaskStatus,
};
