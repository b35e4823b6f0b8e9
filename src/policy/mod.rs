//! Task-ordering policy and its supporting rules.

pub mod equivalence;
pub mod on_error;
pub mod ordering;

pub use equivalence::tasks_equivalent;
pub use on_error::OnErrorPolicyInterpreter;
pub use ordering::DefaultPolicy;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::model::{Credentials, JobId, JobPriority};

/// One locked job as the policy sees it: identity, ordering inputs and its
/// placeable tasks.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub owner: String,
    pub credentials: Credentials,
    pub priority: JobPriority,
    pub start_at: Option<String>,
    pub tasks: Vec<TaskDescriptor>,
}

#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub name: String,
    pub start_at: Option<String>,
    pub rendered_scripts: BTreeSet<String>,
    pub parallel: bool,
    pub exclusive_node_access: bool,
}

/// A task the policy selected for placement, with everything the resource
/// search needs.
#[derive(Debug, Clone)]
pub struct EligibleTask {
    pub job_id: JobId,
    pub task_name: String,
    pub owner: String,
    pub credentials: Credentials,
    pub priority: JobPriority,
    pub rendered_scripts: BTreeSet<String>,
    pub parallel: bool,
    pub exclusive_node_access: bool,
}

/// Pluggable ordering strategy: turns the locked snapshot into the ordered
/// sequence of tasks one pass will try to place.
pub trait Policy: Send + Sync {
    fn ordered_tasks(&self, jobs: &[JobDescriptor], now: DateTime<Utc>) -> Vec<EligibleTask>;
}
