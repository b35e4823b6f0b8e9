use thiserror::Error;

use crate::model::JobId;
use crate::service::SchedulerStatus;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    UnknownJob(JobId),

    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error("submission refused, scheduler is {0}")]
    SubmissionRefused(SchedulerStatus),

    #[error("resource manager error: {0}")]
    ResourceManager(String),

    #[error("task launch failed: {0}")]
    Launch(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
