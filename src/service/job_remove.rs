//! Housekeeping removal of one job.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::model::{JobId, JobInfo};
use crate::ports::{NotificationData, SchedulerEvent};
use crate::service::SchedulingService;

/// One unit of removal work: kill the job if it is still live, then purge it
/// from persistence and notify. Safe to run more than once; only the first
/// run reports true.
pub struct JobRemoveHandler {
    service: Arc<SchedulingService>,
    job_id: JobId,
}

impl JobRemoveHandler {
    pub fn new(service: Arc<SchedulingService>, job_id: JobId) -> Self {
        Self { service, job_id }
    }

    pub async fn call(&self) -> bool {
        if self.service.jobs().is_job_alive(self.job_id).await {
            let batch = self.service.jobs().kill_job(self.job_id).await;
            batch.handle_termination(&self.service).await;
        }
        let db = self.service.infrastructure().db();
        let Some(job) = db.load_job_with_tasks_if_not_removed(self.job_id).await else {
            debug!(job_id = self.job_id, "job absent or already removed");
            return false;
        };
        db.remove_job(
            self.job_id,
            Utc::now(),
            self.service.config().remove_job_from_db,
        )
        .await;
        info!(job_id = self.job_id, "job removed");
        self.service.listener().job_state_updated(
            &job.owner,
            NotificationData::new(SchedulerEvent::JobRemoveFinished, JobInfo::of(&job)),
        );
        true
    }
}
