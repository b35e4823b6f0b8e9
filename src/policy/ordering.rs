use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{EligibleTask, JobDescriptor, Policy};

/// Default ordering: jobs by descending priority, then by ascending job id
/// (FIFO within a priority), tasks in their job-definition order. Deferred
/// starts are honored at both granularities; a deferred job withholds all of
/// its tasks no matter what their own timestamps say.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

/// A malformed timestamp does not defer; the task stays eligible.
fn deferred(start_at: Option<&str>, now: DateTime<Utc>) -> bool {
    let Some(raw) = start_at else {
        return false;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts.with_timezone(&Utc) > now,
        Err(err) => {
            warn!(start_at = raw, error = %err, "malformed start-at, not deferring");
            false
        }
    }
}

impl Policy for DefaultPolicy {
    fn ordered_tasks(&self, jobs: &[JobDescriptor], now: DateTime<Utc>) -> Vec<EligibleTask> {
        let mut sorted: Vec<&JobDescriptor> = jobs.iter().collect();
        sorted.sort_by_key(|j| (Reverse(j.priority), j.job_id));

        let mut out = Vec::new();
        for job in sorted {
            if deferred(job.start_at.as_deref(), now) {
                continue;
            }
            for task in &job.tasks {
                if deferred(task.start_at.as_deref(), now) {
                    continue;
                }
                out.push(EligibleTask {
                    job_id: job.job_id,
                    task_name: task.name.clone(),
                    owner: job.owner.clone(),
                    credentials: job.credentials.clone(),
                    priority: job.priority,
                    rendered_scripts: task.rendered_scripts.clone(),
                    parallel: task.parallel,
                    exclusive_node_access: task.exclusive_node_access,
                });
            }
        }
        out
    }
}
